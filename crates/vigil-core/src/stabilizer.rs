//! Per-slot hysteresis voting over matched identity labels.
//!
//! Each slot keeps a bounded window of recent labels. A new slot shows its
//! first vote at once; after that the displayed label only moves to a new
//! value once that value has been the window majority for
//! `switch_threshold` consecutive frames.

use crate::slots::SlotId;
use crate::types::UNDETECTED;
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_VOTE_WINDOW: usize = 10;
pub const DEFAULT_SWITCH_THRESHOLD: usize = 35;

#[derive(Debug, Clone, Copy)]
pub struct StabilizerConfig {
    pub vote_window: usize,
    pub switch_threshold: usize,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            vote_window: DEFAULT_VOTE_WINDOW,
            switch_threshold: DEFAULT_SWITCH_THRESHOLD,
        }
    }
}

/// Voting state of one face slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotPhase {
    /// No vote recorded yet.
    Voting,
    Stable(String),
}

#[derive(Debug, Clone)]
pub struct FaceSlot {
    votes: VecDeque<String>,
    phase: SlotPhase,
    /// Consecutive frames the majority has confirmed the stable label.
    agreement: usize,
    /// Majority label waiting to replace the stable one, with its streak.
    candidate: Option<(String, usize)>,
}

impl FaceSlot {
    fn new(window: usize) -> Self {
        Self {
            votes: VecDeque::with_capacity(window),
            phase: SlotPhase::Voting,
            agreement: 0,
            candidate: None,
        }
    }

    pub fn phase(&self) -> &SlotPhase {
        &self.phase
    }

    pub fn agreement(&self) -> usize {
        self.agreement
    }

    /// Label shown for this slot right now.
    pub fn label(&self) -> &str {
        match &self.phase {
            SlotPhase::Stable(label) => label,
            SlotPhase::Voting => UNDETECTED,
        }
    }

    fn push(&mut self, label: &str, config: &StabilizerConfig) {
        if self.votes.len() == config.vote_window.max(1) {
            self.votes.pop_front();
        }
        self.votes.push_back(label.to_string());

        let Some(majority) = majority(&self.votes) else {
            return;
        };

        if self.phase == SlotPhase::Voting {
            self.phase = SlotPhase::Stable(majority);
            return;
        }

        if matches!(&self.phase, SlotPhase::Stable(s) if *s == majority) {
            self.agreement += 1;
            self.candidate = None;
            return;
        }

        self.agreement = 0;
        let continuing = matches!(&self.candidate, Some((cand, _)) if *cand == majority);
        if !continuing {
            self.candidate = Some((majority.clone(), 0));
        }
        let streak = match self.candidate.as_mut() {
            Some((_, streak)) => {
                *streak += 1;
                *streak
            }
            None => 1,
        };

        if streak >= config.switch_threshold {
            tracing::debug!(label = %majority, streak, "slot label switched");
            self.phase = SlotPhase::Stable(majority);
            self.candidate = None;
        }
    }
}

/// Most frequent label; ties go to the label that appears first in the window.
pub fn majority(votes: &VecDeque<String>) -> Option<String> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for v in votes {
        match counts.iter_mut().find(|(l, _)| *l == v.as_str()) {
            Some((_, c)) => *c += 1,
            None => counts.push((v.as_str(), 1)),
        }
    }

    let mut best: Option<(&str, usize)> = None;
    for (label, count) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((label, count));
        }
    }
    best.map(|(l, _)| l.to_string())
}

/// Stabilizer state for every live slot of one feed.
#[derive(Debug, Default)]
pub struct IdentityStabilizer {
    config: StabilizerConfig,
    slots: HashMap<SlotId, FaceSlot>,
}

impl IdentityStabilizer {
    pub fn new(config: StabilizerConfig) -> Self {
        Self {
            config,
            slots: HashMap::new(),
        }
    }

    /// Record this frame's matched label for `slot` and return the label to display.
    pub fn observe(&mut self, slot: SlotId, label: &str) -> String {
        let window = self.config.vote_window;
        let state = self.slots.entry(slot).or_insert_with(|| FaceSlot::new(window));
        state.push(label, &self.config);
        state.label().to_string()
    }

    pub fn forget(&mut self, slots: &[SlotId]) {
        for id in slots {
            self.slots.remove(id);
        }
    }

    pub fn slot(&self, id: SlotId) -> Option<&FaceSlot> {
        self.slots.get(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
