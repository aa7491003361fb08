//! Typed identifiers.
//!
//! Every entity gets its own id newtype so a `TeamId` cannot be handed to a
//! function expecting a `ContractId`. All of them wrap a v4 [`Uuid`] except
//! the externally-sourced ones ([`UserId`], [`ExternalTeamId`], [`Kid`]),
//! which are opaque strings minted by the client app or the key-rotation path.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Tenant envelope id.
    AppId
);
uuid_id!(TeamId);
uuid_id!(
    /// Stable bill-to addressee; survives team renames.
    BillToId
);
uuid_id!(BundleId);
uuid_id!(ContractId);
uuid_id!(PlanId);
uuid_id!(AddonId);
uuid_id!(ProductMapId);
uuid_id!(PriceBookId);
uuid_id!(PriceRuleId);
uuid_id!(UsageEventId);
uuid_id!(LineItemId);
uuid_id!(LedgerAccountId);
uuid_id!(LedgerEntryId);
uuid_id!(InvoiceId);
uuid_id!(InvoiceLineId);
uuid_id!(SubscriptionId);
uuid_id!(SecretId);
uuid_id!(AuditLogId);

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// End-user identifier as minted by the client app; opaque to us.
    UserId
);
string_id!(
    /// The client app's own team identifier, used for idempotent team creation.
    ExternalTeamId
);
string_id!(
    /// Key identifier selecting which `AppSecret` signed/verifies a token.
    Kid
);
