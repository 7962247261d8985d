//! History-window prompt builder

use std::collections::VecDeque;

use crate::env::Observation;
use crate::llm::{Image, Message};

#[derive(Debug, Clone)]
enum Entry {
    Observation {
        text: String,
        short_term: String,
        image: Option<Image>,
    },
    Action {
        action: String,
        reasoning: Option<String>,
    },
}

/// Keeps the last `max_text_history` observation/action pairs and renders
/// them as chat turns. Only the most recent `max_image_history` observations
/// carry their frame, and only the most recent `max_cot_history` actions are
/// rendered with their reasoning.
#[derive(Debug, Clone)]
pub struct HistoryPromptBuilder {
    system_prompt: Option<String>,
    entries: VecDeque<Entry>,
    pending_reasoning: Option<String>,
    max_text_history: usize,
    max_image_history: usize,
    max_cot_history: usize,
}

impl HistoryPromptBuilder {
    pub fn new(max_text_history: usize, max_image_history: usize, max_cot_history: usize) -> Self {
        Self {
            system_prompt: None,
            entries: VecDeque::new(),
            pending_reasoning: None,
            max_text_history,
            max_image_history,
            max_cot_history,
        }
    }

    pub fn reset(&mut self) {
        self.system_prompt = None;
        self.entries.clear();
        self.pending_reasoning = None;
    }

    pub fn update_instruction_prompt(&mut self, prompt: &str) {
        self.system_prompt = Some(prompt.to_string());
    }

    pub fn update_observation(&mut self, obs: &Observation) {
        self.entries.push_back(Entry::Observation {
            text: obs.text.long_term_context.clone(),
            short_term: obs.text.short_term_context.clone(),
            image: obs.image.clone(),
        });
        self.trim();
    }

    /// Record the action taken; attaches reasoning recorded since the last action
    pub fn update_action(&mut self, action: &str) {
        self.entries.push_back(Entry::Action {
            action: action.to_string(),
            reasoning: self.pending_reasoning.take(),
        });
        self.trim();
    }

    pub fn update_reasoning(&mut self, reasoning: &str) {
        self.pending_reasoning = Some(reasoning.to_string());
    }

    fn trim(&mut self) {
        let max_entries = self.max_text_history.max(1) * 2;
        while self.entries.len() > max_entries {
            self.entries.pop_front();
        }
    }

    pub fn system_message(&self) -> Option<Message> {
        self.system_prompt.as_deref().map(Message::system)
    }

    /// History turns without the system prompt
    pub fn history_messages(&self) -> Vec<Message> {
        let total_obs = self
            .entries
            .iter()
            .filter(|e| matches!(e, Entry::Observation { .. }))
            .count();
        let total_actions = self.entries.len() - total_obs;

        let mut messages = Vec::with_capacity(self.entries.len());
        let mut obs_seen = 0;
        let mut actions_seen = 0;

        for entry in &self.entries {
            match entry {
                Entry::Observation {
                    text,
                    short_term,
                    image,
                } => {
                    obs_seen += 1;
                    let remaining = total_obs - obs_seen;
                    let content = if remaining == 0 {
                        if short_term.is_empty() {
                            format!("Current Observation:\n{}", text)
                        } else {
                            format!("Current Observation:\n{}\n{}", text, short_term)
                        }
                    } else {
                        format!("Observation:\n{}", text)
                    };
                    let attach = if remaining < self.max_image_history {
                        image.clone()
                    } else {
                        None
                    };
                    messages.push(Message::user(content).with_attachment(attach));
                }
                Entry::Action { action, reasoning } => {
                    actions_seen += 1;
                    let recent = total_actions - actions_seen < self.max_cot_history;
                    let content = match reasoning {
                        Some(reasoning) if recent => reasoning.clone(),
                        _ => action.clone(),
                    };
                    messages.push(Message::assistant(content));
                }
            }
        }
        messages
    }

    /// System prompt followed by the history window
    pub fn get_prompt(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = self.system_message().into_iter().collect();
        messages.extend(self.history_messages());
        messages
    }
}
