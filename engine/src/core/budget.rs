//! Turn budget for the agent loop.

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("turn budget of {max_turns} exhausted")]
pub struct BudgetExhausted {
    pub max_turns: u32,
}

/// Counts LLM turns and refuses to start one past `max_turns`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnBudget {
    max_turns: u32,
    used: u32,
}

impl TurnBudget {
    pub fn new(max_turns: u32) -> Self {
        Self { max_turns, used: 0 }
    }

    /// Reserve the next turn, returning its 1-based number.
    pub fn begin_turn(&mut self) -> Result<u32, BudgetExhausted> {
        if self.used >= self.max_turns {
            return Err(BudgetExhausted {
                max_turns: self.max_turns,
            });
        }
        self.used += 1;
        Ok(self.used)
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn remaining(&self) -> u32 {
        self.max_turns.saturating_sub(self.used)
    }
}
