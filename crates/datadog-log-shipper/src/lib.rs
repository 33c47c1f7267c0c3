// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod discovery;
pub mod error;
pub mod host;
pub mod http_utils;
pub mod inflight;
pub mod ingress;
pub mod inventory;
pub mod join;
pub mod logfile;
pub mod logsets;
pub mod pipeline;
pub mod registry;
pub mod remote;
pub mod scripts;
pub mod shipper;
pub mod storage;
pub mod worker;
pub mod zones;
