//! Protocol actions and their request/callback pairing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Every action a gateway envelope can carry.
///
/// UHI actions come in request/callback pairs (`select` / `on_select`). The claims-exchange
/// actions follow the same convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Search,
    OnSearch,
    Select,
    OnSelect,
    Init,
    OnInit,
    Confirm,
    OnConfirm,
    Status,
    OnStatus,
    Cancel,
    OnCancel,
    PreauthSubmit,
    OnPreauthSubmit,
    ClaimSubmit,
    OnClaimSubmit,
}

impl Action {
    pub const ALL: [Action; 16] = [
        Action::Search,
        Action::OnSearch,
        Action::Select,
        Action::OnSelect,
        Action::Init,
        Action::OnInit,
        Action::Confirm,
        Action::OnConfirm,
        Action::Status,
        Action::OnStatus,
        Action::Cancel,
        Action::OnCancel,
        Action::PreauthSubmit,
        Action::OnPreauthSubmit,
        Action::ClaimSubmit,
        Action::OnClaimSubmit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Search => "search",
            Action::OnSearch => "on_search",
            Action::Select => "select",
            Action::OnSelect => "on_select",
            Action::Init => "init",
            Action::OnInit => "on_init",
            Action::Confirm => "confirm",
            Action::OnConfirm => "on_confirm",
            Action::Status => "status",
            Action::OnStatus => "on_status",
            Action::Cancel => "cancel",
            Action::OnCancel => "on_cancel",
            Action::PreauthSubmit => "preauth_submit",
            Action::OnPreauthSubmit => "on_preauth_submit",
            Action::ClaimSubmit => "claim_submit",
            Action::OnClaimSubmit => "on_claim_submit",
        }
    }

    /// Parses the wire name of an action.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|a| a.as_str() == s)
    }

    /// True for `on_*` actions sent by the responding participant.
    pub fn is_callback(&self) -> bool {
        self.request().is_some()
    }

    /// True for the claims-exchange actions.
    pub fn is_claims(&self) -> bool {
        matches!(
            self,
            Action::PreauthSubmit
                | Action::OnPreauthSubmit
                | Action::ClaimSubmit
                | Action::OnClaimSubmit
        )
    }

    /// The callback answering this request action.
    pub fn callback(&self) -> Option<Action> {
        match self {
            Action::Search => Some(Action::OnSearch),
            Action::Select => Some(Action::OnSelect),
            Action::Init => Some(Action::OnInit),
            Action::Confirm => Some(Action::OnConfirm),
            Action::Status => Some(Action::OnStatus),
            Action::Cancel => Some(Action::OnCancel),
            Action::PreauthSubmit => Some(Action::OnPreauthSubmit),
            Action::ClaimSubmit => Some(Action::OnClaimSubmit),
            _ => None,
        }
    }

    /// The request this callback action answers.
    pub fn request(&self) -> Option<Action> {
        match self {
            Action::OnSearch => Some(Action::Search),
            Action::OnSelect => Some(Action::Select),
            Action::OnInit => Some(Action::Init),
            Action::OnConfirm => Some(Action::Confirm),
            Action::OnStatus => Some(Action::Status),
            Action::OnCancel => Some(Action::Cancel),
            Action::OnPreauthSubmit => Some(Action::PreauthSubmit),
            Action::OnClaimSubmit => Some(Action::ClaimSubmit),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
