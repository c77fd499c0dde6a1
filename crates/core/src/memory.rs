use crate::models::Turn;
use std::collections::VecDeque;

/// Ordered conversation buffer. With a turn limit, the oldest turns are
/// dropped first; unlimited by default.
#[derive(Debug, Clone, Default)]
pub struct ConversationMemory {
    turns: VecDeque<Turn>,
    max_turns: Option<usize>,
}

impl ConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            max_turns: Some(max_turns.max(2)),
        }
    }

    /// Records one question/answer exchange.
    pub fn record_exchange(&mut self, question: &str, answer: &str) {
        self.turns.push_back(Turn::user(question));
        self.turns.push_back(Turn::assistant(answer));

        if let Some(limit) = self.max_turns {
            while self.turns.len() > limit {
                self.turns.pop_front();
            }
        }
    }

    pub fn turns(&self) -> Vec<Turn> {
        self.turns.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    #[test]
    fn exchanges_append_user_then_assistant() {
        let mut memory = ConversationMemory::new();
        memory.record_exchange("q1", "a1");
        memory.record_exchange("q2", "a2");

        let roles = memory
            .turns()
            .into_iter()
            .map(|turn| turn.role)
            .collect::<Vec<_>>();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        assert_eq!(memory.turns()[2].text, "q2");
    }

    #[test]
    fn limit_drops_oldest_turns() {
        let mut memory = ConversationMemory::with_limit(2);
        memory.record_exchange("q1", "a1");
        memory.record_exchange("q2", "a2");

        assert_eq!(memory.turns(), vec![Turn::user("q2"), Turn::assistant("a2")]);

        memory.clear();
        assert!(memory.is_empty());
    }
}
