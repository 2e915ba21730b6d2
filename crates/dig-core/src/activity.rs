use crate::{AgentName, InvestigationStatus, LogEntry};
use serde::{Deserialize, Serialize};

/// Number of trailing entries that count as "recent" for liveness.
pub const RECENT_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentActivity {
    #[default]
    Idle,
    Waiting,
    Active,
    Completed,
}

impl AgentActivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentActivity::Idle => "idle",
            AgentActivity::Waiting => "waiting",
            AgentActivity::Active => "active",
            AgentActivity::Completed => "completed",
        }
    }
}

/// Per-agent activity. Agents outside the fixed set share the `other` slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentBoard {
    pub coordinator: AgentActivity,
    pub scout: AgentActivity,
    pub analyst: AgentActivity,
    pub narrator: AgentActivity,
    pub other: AgentActivity,
}

impl AgentBoard {
    pub fn uniform(activity: AgentActivity) -> Self {
        Self {
            coordinator: activity,
            scout: activity,
            analyst: activity,
            narrator: activity,
            other: activity,
        }
    }

    pub fn get(&self, agent: &AgentName) -> AgentActivity {
        match agent {
            AgentName::Coordinator => self.coordinator,
            AgentName::Scout => self.scout,
            AgentName::Analyst => self.analyst,
            AgentName::Narrator => self.narrator,
            AgentName::Other(_) => self.other,
        }
    }

    pub fn set(&mut self, agent: &AgentName, activity: AgentActivity) {
        let slot = match agent {
            AgentName::Coordinator => &mut self.coordinator,
            AgentName::Scout => &mut self.scout,
            AgentName::Analyst => &mut self.analyst,
            AgentName::Narrator => &mut self.narrator,
            AgentName::Other(_) => &mut self.other,
        };
        *slot = activity;
    }

    pub fn entries(&self) -> [(&'static str, AgentActivity); 5] {
        [
            ("coordinator", self.coordinator),
            ("scout", self.scout),
            ("analyst", self.analyst),
            ("narrator", self.narrator),
            ("other", self.other),
        ]
    }
}

/// Pure function of the log sequence and job status. Terminal jobs show every
/// agent as completed; otherwise an agent is active when it spoke within the
/// last [`RECENT_WINDOW`] entries, waiting when it spoke earlier, idle when
/// it never did.
pub fn derive(logs: &[LogEntry], status: &InvestigationStatus) -> AgentBoard {
    if status.is_terminal() {
        return AgentBoard::uniform(AgentActivity::Completed);
    }

    let recent_start = logs.len().saturating_sub(RECENT_WINDOW);
    let mut board = AgentBoard::default();
    for (index, entry) in logs.iter().enumerate() {
        let next = if index >= recent_start {
            AgentActivity::Active
        } else {
            AgentActivity::Waiting
        };
        if board.get(&entry.agent) != AgentActivity::Active {
            board.set(&entry.agent, next);
        }
    }
    board
}
