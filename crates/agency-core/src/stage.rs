use crate::error::SubmitError;

/// Execution stages of one submission run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStage {
    Validating,
    LedgerPending,
    RecordCreated,
    ExternalCall,
    Reconciling,
    SideEffect,
    Finalizing,
    Done,
    Failed,
}

impl SubmitStage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::LedgerPending => "ledger_pending",
            Self::RecordCreated => "record_created",
            Self::ExternalCall => "external_call",
            Self::Reconciling => "reconciling",
            Self::SideEffect => "side_effect",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    fn may_advance_to(self, next: SubmitStage) -> bool {
        matches!(
            (self, next),
            (Self::Validating, Self::LedgerPending)
                | (Self::LedgerPending, Self::RecordCreated)
                | (Self::RecordCreated, Self::ExternalCall)
                | (Self::ExternalCall, Self::Reconciling)
                | (Self::ExternalCall, Self::Failed)
                | (Self::Reconciling, Self::SideEffect)
                | (Self::SideEffect, Self::Finalizing)
                | (Self::Finalizing, Self::Done)
        )
    }
}

/// Enforces the stage ordering of the pipeline.
///
/// The machine is intentionally explicit so an accidental skip cannot
/// happen silently. `failed` is reachable only from the external call;
/// every other step degrades without leaving the main path.
#[derive(Debug, Clone)]
pub struct SubmitStageMachine {
    stage: SubmitStage,
}

impl SubmitStageMachine {
    pub fn new() -> Self {
        Self {
            stage: SubmitStage::Validating,
        }
    }

    pub fn stage(&self) -> SubmitStage {
        self.stage
    }

    pub fn advance(&mut self, next: SubmitStage) -> Result<(), SubmitError> {
        if !self.stage.may_advance_to(next) {
            return Err(SubmitError::Internal(format!(
                "stage order violation: cannot move from '{}' to '{}'",
                self.stage.name(),
                next.name()
            )));
        }
        self.stage = next;
        Ok(())
    }
}

impl Default for SubmitStageMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_the_success_path_in_order() {
        let mut machine = SubmitStageMachine::new();
        for next in [
            SubmitStage::LedgerPending,
            SubmitStage::RecordCreated,
            SubmitStage::ExternalCall,
            SubmitStage::Reconciling,
            SubmitStage::SideEffect,
            SubmitStage::Finalizing,
            SubmitStage::Done,
        ] {
            machine.advance(next).unwrap();
        }
        assert_eq!(machine.stage(), SubmitStage::Done);
    }

    #[test]
    fn failed_is_only_reachable_from_the_external_call() {
        let mut machine = SubmitStageMachine::new();
        assert!(machine.advance(SubmitStage::Failed).is_err());

        machine.advance(SubmitStage::LedgerPending).unwrap();
        machine.advance(SubmitStage::RecordCreated).unwrap();
        machine.advance(SubmitStage::ExternalCall).unwrap();
        machine.advance(SubmitStage::Failed).unwrap();
        assert_eq!(machine.stage(), SubmitStage::Failed);
    }

    #[test]
    fn rejects_skipping_stages() {
        let mut machine = SubmitStageMachine::new();
        let err = machine.advance(SubmitStage::ExternalCall).unwrap_err();
        assert!(err.to_string().contains("stage order violation"));
    }
}
