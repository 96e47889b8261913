use std::time::Duration;

/// One debounced directory search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTicket {
    pub generation: u64,
    pub query: String,
}

/// Generation counter for debounced searches.
///
/// Every new query supersedes the previous ones; a ticket whose generation is
/// no longer current must not issue its request or apply its results.
#[derive(Debug, Clone)]
pub struct SearchDebouncer {
    generation: u64,
    delay: Duration,
}

impl SearchDebouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            generation: 0,
            delay,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn begin(&mut self, query: &str) -> SearchTicket {
        self.generation = self.generation.wrapping_add(1);
        SearchTicket {
            generation: self.generation,
            query: query.trim().to_owned(),
        }
    }

    pub fn is_current(&self, ticket: &SearchTicket) -> bool {
        ticket.generation == self.generation
    }

    /// Abandon every outstanding ticket.
    pub fn cancel(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }
}
