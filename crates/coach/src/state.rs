use super::store::TurnToken;

/// Lifecycle of the outbound turn of one conversation surface.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Sending(TurnToken),
    Streaming(TurnToken),
    AwaitingThreadCreation(TurnToken),
    /// Transient; the engine resets to `Idle` right after rolling the turn back.
    Failed { turn: TurnToken, reason: String },
}

/// State transition input for the turn lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTransition {
    Begin(TurnToken),
    Stream(TurnToken),
    AwaitThread(TurnToken),
    Complete(TurnToken),
    Fail { turn: TurnToken, reason: String },
    ResetToIdle,
}

/// Rejection reason for illegal turn transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionRejection {
    TurnInFlight {
        active: TurnToken,
        attempted: TurnToken,
    },
    NoActiveTurn,
    AlreadyBranched {
        turn: TurnToken,
    },
    TurnMismatch {
        active: TurnToken,
        attempted: TurnToken,
    },
}

pub type TransitionResult = Result<SessionState, TransitionRejection>;

impl SessionState {
    /// Returns the turn currently holding the session, if any.
    pub fn active_turn(&self) -> Option<TurnToken> {
        match self {
            Self::Sending(turn) | Self::Streaming(turn) | Self::AwaitingThreadCreation(turn) => {
                Some(*turn)
            }
            Self::Idle | Self::Failed { .. } => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_in_flight(&self) -> bool {
        self.active_turn().is_some()
    }

    /// Applies one transition deterministically.
    ///
    /// Only an idle session may begin a turn. `Stream` and `AwaitThread` leave `Sending`
    /// for the branch the turn took; terminal transitions must name the active turn.
    pub fn apply(&self, transition: SessionTransition) -> TransitionResult {
        match transition {
            SessionTransition::Begin(turn) => self.apply_begin(turn),
            SessionTransition::Stream(turn) => {
                self.apply_branch(turn, SessionState::Streaming(turn))
            }
            SessionTransition::AwaitThread(turn) => {
                self.apply_branch(turn, SessionState::AwaitingThreadCreation(turn))
            }
            SessionTransition::Complete(turn) => {
                self.expect_active(turn)?;
                Ok(Self::Idle)
            }
            SessionTransition::Fail { turn, reason } => {
                self.expect_active(turn)?;
                Ok(Self::Failed { turn, reason })
            }
            SessionTransition::ResetToIdle => Ok(Self::Idle),
        }
    }

    fn apply_begin(&self, turn: TurnToken) -> TransitionResult {
        match self.active_turn() {
            Some(active) => Err(TransitionRejection::TurnInFlight {
                active,
                attempted: turn,
            }),
            None => Ok(Self::Sending(turn)),
        }
    }

    fn apply_branch(&self, turn: TurnToken, next: SessionState) -> TransitionResult {
        if *self == next {
            return Ok(next);
        }

        match self {
            Self::Sending(active) if *active == turn => Ok(next),
            Self::Streaming(active) | Self::AwaitingThreadCreation(active) if *active == turn => {
                Err(TransitionRejection::AlreadyBranched { turn })
            }
            Self::Sending(active) | Self::Streaming(active) | Self::AwaitingThreadCreation(active) => {
                Err(TransitionRejection::TurnMismatch {
                    active: *active,
                    attempted: turn,
                })
            }
            Self::Idle | Self::Failed { .. } => Err(TransitionRejection::NoActiveTurn),
        }
    }

    fn expect_active(&self, turn: TurnToken) -> Result<(), TransitionRejection> {
        match self.active_turn() {
            Some(active) if active == turn => Ok(()),
            Some(active) => Err(TransitionRejection::TurnMismatch {
                active,
                attempted: turn,
            }),
            None => Err(TransitionRejection::NoActiveTurn),
        }
    }
}
