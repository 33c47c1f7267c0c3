// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Common test utilities, fakes, and helpers for integration tests

pub mod helpers;
pub mod mocks;
