//! Per-worker aggregated event counters.

use std::collections::{HashMap, VecDeque};

use crate::rpc::RpcEvent;

/// How many recent events are retained per worker.
pub const EVENT_RING_CAPACITY: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct WorkerActivity {
    pub tool_use_count: u64,
    pub current_tool_name: Option<String>,
    pub last_tool_name: Option<String>,
    pub turn_count: u64,
    pub total_tokens: u64,
    recent: VecDeque<String>,
}

impl WorkerActivity {
    /// Event types of the most recent events, oldest first.
    pub fn recent_events(&self) -> impl Iterator<Item = &str> {
        self.recent.iter().map(String::as_str)
    }
}

#[derive(Debug, Default)]
pub struct ActivityTracker {
    workers: HashMap<String, WorkerActivity>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance counters for one worker event.
    pub fn advance(&mut self, name: &str, event: &RpcEvent) {
        let activity = self.workers.entry(name.to_string()).or_default();

        match event.event_type.as_str() {
            "agent_start" => activity.turn_count += 1,
            "tool_execution_start" => {
                activity.tool_use_count += 1;
                activity.current_tool_name = event.tool_name().map(|t| t.to_string());
            }
            "tool_execution_end" => {
                if let Some(current) = activity.current_tool_name.take() {
                    activity.last_tool_name = Some(current);
                } else if let Some(tool) = event.tool_name() {
                    activity.last_tool_name = Some(tool.to_string());
                }
            }
            _ => {}
        }
        if let Some(tokens) = event.tokens() {
            activity.total_tokens += tokens;
        }

        activity.recent.push_back(event.event_type.clone());
        while activity.recent.len() > EVENT_RING_CAPACITY {
            activity.recent.pop_front();
        }
    }

    pub fn get(&self, name: &str) -> Option<&WorkerActivity> {
        self.workers.get(name)
    }

    /// Drop a worker's counters on removal.
    pub fn reset(&mut self, name: &str) {
        self.workers.remove(name);
    }
}
