//! Grade lifecycle: statuses, per-field locks and the transition guards.
//!
//! Everything here is pure. Persistence of the resulting record and the
//! event rows lives in `grades`.

use serde::{Deserialize, Serialize};

use crate::calc;
use crate::error::{GradeError, GradeResult};
use crate::grades::GradeRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Instructor,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Instructor => "instructor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GradeStatus {
    Draft,
    PendingReview,
    ApprovedTxDk,
    FinalEntered,
    Finalized,
}

impl GradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::PendingReview => "PENDING_REVIEW",
            Self::ApprovedTxDk => "APPROVED_TX_DK",
            Self::FinalEntered => "FINAL_ENTERED",
            Self::Finalized => "FINALIZED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(Self::Draft),
            "PENDING_REVIEW" => Some(Self::PendingReview),
            "APPROVED_TX_DK" => Some(Self::ApprovedTxDk),
            "FINAL_ENTERED" => Some(Self::FinalEntered),
            "FINALIZED" => Some(Self::Finalized),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradeField {
    Tx,
    Dk,
    Final,
}

impl GradeField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tx => "tx",
            Self::Dk => "dk",
            Self::Final => "final",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tx" => Some(Self::Tx),
            "dk" => Some(Self::Dk),
            "final" => Some(Self::Final),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Locks {
    pub tx_locked: bool,
    pub dk_locked: bool,
    pub final_locked: bool,
}

impl Locks {
    pub fn is_locked(&self, field: GradeField) -> bool {
        match field {
            GradeField::Tx => self.tx_locked,
            GradeField::Dk => self.dk_locked,
            GradeField::Final => self.final_locked,
        }
    }

    pub fn set(&mut self, field: GradeField, locked: bool) {
        match field {
            GradeField::Tx => self.tx_locked = locked,
            GradeField::Dk => self.dk_locked = locked,
            GradeField::Final => self.final_locked = locked,
        }
    }
}

/// Single authorization predicate for field edits.
///
/// A set final lock seals the whole record. A FINALIZED record whose final
/// lock was cleared by an emergency unlock is open to administrators only.
pub fn can_edit(actor: &Actor, record: &GradeRecord, field: GradeField) -> bool {
    if record.locks.final_locked || record.locks.is_locked(field) {
        return false;
    }
    match actor.role {
        Role::Admin => true,
        Role::Instructor => {
            record.status == GradeStatus::Draft
                && matches!(field, GradeField::Tx | GradeField::Dk)
        }
    }
}

pub fn ensure_can_edit(actor: &Actor, record: &GradeRecord, field: GradeField) -> GradeResult<()> {
    if can_edit(actor, record, field) {
        return Ok(());
    }
    let why = if record.locks.final_locked {
        "record is sealed by the final lock".to_string()
    } else if record.locks.is_locked(field) {
        format!("{} is locked", field.as_str())
    } else {
        format!(
            "{} may not edit {} while grade is {}",
            actor.role.as_str(),
            field.as_str(),
            record.status.as_str()
        )
    };
    Err(GradeError::guard(format!("cannot edit {}: {}", field.as_str(), why)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Submit,
    Approve,
    Reject,
    EnterFinal,
    Finalize,
}

impl Transition {
    pub fn name(self) -> &'static str {
        match self {
            Self::Submit => "submit for review",
            Self::Approve => "approve TX/DK",
            Self::Reject => "reject to draft",
            Self::EnterFinal => "enter final score",
            Self::Finalize => "lock final",
        }
    }

    pub fn from_state(self) -> GradeStatus {
        match self {
            Self::Submit => GradeStatus::Draft,
            Self::Approve | Self::Reject => GradeStatus::PendingReview,
            Self::EnterFinal => GradeStatus::ApprovedTxDk,
            Self::Finalize => GradeStatus::FinalEntered,
        }
    }

    pub fn to_state(self) -> GradeStatus {
        match self {
            Self::Submit => GradeStatus::PendingReview,
            Self::Approve => GradeStatus::ApprovedTxDk,
            Self::Reject => GradeStatus::Draft,
            Self::EnterFinal => GradeStatus::FinalEntered,
            Self::Finalize => GradeStatus::Finalized,
        }
    }

    fn admin_only(self) -> bool {
        !matches!(self, Self::Submit)
    }
}

/// Checks role, source state and data guards, then applies the transition to
/// `record` in memory (status and locks). Nothing is touched on failure.
pub fn apply_transition(
    actor: &Actor,
    record: &mut GradeRecord,
    transition: Transition,
    reason: Option<&str>,
) -> GradeResult<GradeStatus> {
    if transition.admin_only() && !actor.is_admin() {
        return Err(GradeError::guard(format!(
            "{} requires an administrator",
            transition.name()
        )));
    }
    if record.status != transition.from_state() {
        return Err(GradeError::guard(format!(
            "cannot {}: grade is {} (expected {})",
            transition.name(),
            record.status.as_str(),
            transition.from_state().as_str()
        )));
    }

    match transition {
        Transition::Submit => {
            if record.tx_scores.is_empty() || record.dk_scores.is_empty() {
                return Err(GradeError::guard(
                    "cannot submit for review: TX and DK scores are required",
                ));
            }
            record.locks.tx_locked = true;
            record.locks.dk_locked = true;
        }
        Transition::Approve => {}
        Transition::Reject => {
            if reason.map(str::trim).unwrap_or("").is_empty() {
                return Err(GradeError::validation("a reason is required to reject"));
            }
            record.locks.tx_locked = false;
            record.locks.dk_locked = false;
        }
        Transition::EnterFinal => {
            if calc::final_is_gated(record.tbkt_score) {
                return Err(GradeError::guard(format!(
                    "cannot enter final score: TBKT {:.2} is below {:.1}",
                    record.tbkt_score.unwrap_or_default(),
                    calc::PASS_THRESHOLD
                )));
            }
            if record.final_score.is_none() {
                return Err(GradeError::guard(
                    "cannot enter final score: final score is empty",
                ));
            }
        }
        Transition::Finalize => {
            if record.final_score.is_none() {
                return Err(GradeError::guard("cannot finalize a grade without a final score"));
            }
            record.locks.final_locked = true;
        }
    }

    record.status = transition.to_state();
    Ok(record.status)
}
