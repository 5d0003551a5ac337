use crate::types::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionState {
    NoPosition,
    Entered,
    Exited,
}

/// Single position slot for one instrument.
#[derive(Debug, Clone)]
pub struct PositionSlot {
    pub state: PositionState,
    pub trade_id: Option<u64>,
    pub direction: Option<Direction>,
    pub entries: u64,
    pub exits: u64,
}

impl Default for PositionSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionSlot {
    pub fn new() -> Self {
        Self {
            state: PositionState::NoPosition,
            trade_id: None,
            direction: None,
            entries: 0,
            exits: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == PositionState::Entered
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Enter { trade_id: u64, direction: Direction },
    Exit { trade_id: u64 },
    /// Exited slot is released for the next entry.
    Release,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionError {
    pub msg: String,
}

pub fn apply_event(slot: &mut PositionSlot, event: Event) -> Result<(), TransitionError> {
    match (slot.state, event) {
        (PositionState::NoPosition, Event::Enter { trade_id, direction }) => {
            slot.state = PositionState::Entered;
            slot.trade_id = Some(trade_id);
            slot.direction = Some(direction);
            slot.entries += 1;
            Ok(())
        }
        (PositionState::Entered, Event::Enter { trade_id, .. }) => Err(TransitionError {
            msg: format!(
                "duplicate entry: trade {} requested while trade {:?} is open",
                trade_id, slot.trade_id
            ),
        }),
        (PositionState::Entered, Event::Exit { trade_id }) => {
            if slot.trade_id != Some(trade_id) {
                return Err(TransitionError {
                    msg: format!("exit for trade {} but open trade is {:?}", trade_id, slot.trade_id),
                });
            }
            slot.state = PositionState::Exited;
            slot.exits += 1;
            Ok(())
        }
        (PositionState::Exited, Event::Release) => {
            slot.state = PositionState::NoPosition;
            slot.trade_id = None;
            slot.direction = None;
            Ok(())
        }
        (PositionState::NoPosition, Event::Release) => Ok(()),
        (PositionState::Exited, Event::Enter { .. }) => Err(TransitionError {
            msg: "entry before exited slot was released".to_string(),
        }),
        (_, Event::Exit { trade_id }) => Err(TransitionError {
            msg: format!("exit for trade {} with no open position", trade_id),
        }),
        (PositionState::Entered, Event::Release) => Err(TransitionError {
            msg: "release while position is open".to_string(),
        }),
    }
}
