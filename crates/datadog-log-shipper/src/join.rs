// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Barrier over a fixed set of named arrivals.
///
/// Each name may arrive once, with or without an error. The join is drained
/// once every name has arrived; its result is the first error recorded, in
/// arrival order, or success.
#[derive(Debug)]
pub struct CompletionJoin<E> {
    expected: Vec<&'static str>,
    arrived: Vec<&'static str>,
    error: Option<E>,
}

impl<E> CompletionJoin<E> {
    pub fn new(names: &[&'static str]) -> Self {
        CompletionJoin {
            expected: names.to_vec(),
            arrived: Vec::with_capacity(names.len()),
            error: None,
        }
    }

    /// Records an arrival. Unknown names and repeat arrivals are ignored and
    /// reported as false.
    pub fn arrive(&mut self, name: &'static str, result: Result<(), E>) -> bool {
        if !self.expected.contains(&name) || self.arrived.contains(&name) {
            return false;
        }
        self.arrived.push(name);
        if let Err(e) = result {
            self.error.get_or_insert(e);
        }
        true
    }

    pub fn has_arrived(&self, name: &str) -> bool {
        self.arrived.iter().any(|arrived| *arrived == name)
    }

    pub fn is_drained(&self) -> bool {
        self.arrived.len() == self.expected.len()
    }

    pub fn pending(&self) -> Vec<&'static str> {
        self.expected
            .iter()
            .filter(|name| !self.arrived.contains(*name))
            .copied()
            .collect()
    }

    pub fn first_error(&self) -> Option<&E> {
        self.error.as_ref()
    }

    pub fn into_result(self) -> Result<(), E> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
