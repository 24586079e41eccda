//! Roles and capabilities.
//!
//! Vault roles gate credentials. Organisation roles gate the records that
//! live outside vaults (bank accounts, legal entities) and reading the
//! security audit log.

use crate::tag::tagged_enum;

tagged_enum! {
    /// A user's role within one vault.
    pub enum Role in "role" {
        Admin => ("admin", "Admin"),
        Editor => ("editor", "Editor"),
        Revealer => ("revealer", "Revealer"),
        Viewer => ("viewer", "Viewer"),
    }
}

impl Role {
    pub fn description(&self) -> &'static str {
        match self {
            Self::Admin => "Full access including membership management",
            Self::Editor => "Can create and update credentials, cannot reveal secrets",
            Self::Revealer => "Can view and reveal secrets, cannot edit",
            Self::Viewer => "Can view masked credentials only",
        }
    }

    /// Every role can see masked credentials.
    pub fn can_view(&self) -> bool {
        true
    }

    pub fn can_edit(&self) -> bool {
        matches!(self, Self::Admin | Self::Editor)
    }

    pub fn can_reveal(&self) -> bool {
        matches!(self, Self::Admin | Self::Revealer)
    }

    pub fn can_manage_members(&self) -> bool {
        matches!(self, Self::Admin)
    }

    /// Check a capability by name.
    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::View => self.can_view(),
            Capability::Edit => self.can_edit(),
            Capability::Reveal => self.can_reveal(),
            Capability::ManageMembers => self.can_manage_members(),
        }
    }
}

/// A vault-level capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    View,
    Edit,
    Reveal,
    ManageMembers,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Edit => "edit",
            Self::Reveal => "reveal",
            Self::ManageMembers => "manage_members",
        }
    }
}

tagged_enum! {
    /// A user's organisation-wide role.
    pub enum UserRole in "role" {
        Admin => ("admin", "Admin"),
        Ops => ("ops", "Ops"),
        Member => ("member", "Member"),
    }
}

impl UserRole {
    fn is_elevated(&self) -> bool {
        matches!(self, Self::Admin | Self::Ops)
    }

    /// Reveal bank numbers and tax IDs.
    pub fn can_reveal_secrets(&self) -> bool {
        self.is_elevated()
    }

    /// Create, update and close bank accounts and legal entity secrets.
    pub fn can_manage_bank_accounts(&self) -> bool {
        self.is_elevated()
    }

    /// Query the security audit log.
    pub fn can_read_audit_log(&self) -> bool {
        self.is_elevated()
    }
}
