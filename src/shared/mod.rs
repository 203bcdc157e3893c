// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! This module holds constants/structures that are shared between the faulting
//! process and the reporter process.

pub(crate) mod constants;

pub mod configuration;
