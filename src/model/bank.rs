//! Types exchanged with the Bank API while linking a bank.

use crate::model::Amount;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use zeroize::Zeroize;

/// What the user typed into the credential forms. Mutable throughout the first three steps and
/// never persisted by this crate.
#[derive(Default, Clone, Eq, PartialEq, Serialize)]
pub struct BankCredentialDraft {
    /// The bank identifier (BLZ).
    pub routing_code: String,
    pub login: String,
    /// PIN or password. Skipped during serialization and redacted in `Debug`.
    #[serde(skip_serializing)]
    pub secret: String,
    pub tan_method: Option<String>,
    pub tan_medium: Option<String>,
}

impl BankCredentialDraft {
    /// Overwrites the secret in memory and leaves it empty.
    pub(crate) fn wipe_secret(&mut self) {
        self.secret.zeroize();
    }

    /// Wipes the secret and returns every field to its default.
    pub(crate) fn discard(&mut self) {
        self.wipe_secret();
        *self = Self::default();
    }
}

impl Debug for BankCredentialDraft {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BankCredentialDraft")
            .field("routing_code", &self.routing_code)
            .field("login", &self.login)
            .field("secret", &if self.secret.is_empty() { "" } else { "***" })
            .field("tan_method", &self.tan_method)
            .field("tan_medium", &self.tan_medium)
            .finish()
    }
}

/// The resolved identity of a bank.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BankLookupResult {
    pub name: String,
    pub routing_code: String,
    /// Where the collaborator reaches this bank, e.g. a FinTS URL.
    pub endpoint: String,
}

/// One way of approving a login or transaction.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TanMethod {
    pub code: String,
    pub name: String,
    /// Approval happens on another device with no code to type in, e.g. a push notification.
    #[serde(default)]
    pub is_decoupled: bool,
    /// Device names the bank offers for this method. Only meaningful when decoupled.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tan_media: Vec<String>,
}

/// The answer to a TAN-method query.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TanMethods {
    pub methods: Vec<TanMethod>,
    #[serde(default)]
    pub default_method_code: Option<String>,
}

impl TanMethods {
    /// The method to pre-select: the collaborator's default when it is one of the returned
    /// methods, otherwise the first.
    pub fn default_method(&self) -> Option<&TanMethod> {
        self.default_method_code
            .as_deref()
            .and_then(|code| self.find(code))
            .or_else(|| self.methods.first())
    }

    pub fn find(&self, code: &str) -> Option<&TanMethod> {
        self.methods.iter().find(|m| m.code == code)
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// An account found at the bank. The IBAN is the key.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredAccount {
    pub iban: String,
    pub default_name: String,
    pub balance: Amount,
    pub currency: String,
}

/// IBAN -> chosen display name.
pub type AccountNameOverrides = BTreeMap<String, String>;

/// An account that was actually imported, with its final name.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImportedAccount {
    pub iban: String,
    pub account_name: String,
}

/// The terminal payload of a successful import.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConnectionResult {
    pub message: String,
    pub accounts_imported: Vec<ImportedAccount>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(code: &str, decoupled: bool) -> TanMethod {
        TanMethod {
            code: code.to_string(),
            name: format!("Method {code}"),
            is_decoupled: decoupled,
            tan_media: Vec::new(),
        }
    }

    #[test]
    fn test_default_method_prefers_indicated_code() {
        let methods = TanMethods {
            methods: vec![method("900", false), method("920", true)],
            default_method_code: Some("920".to_string()),
        };
        assert_eq!(methods.default_method().unwrap().code, "920");
    }

    #[test]
    fn test_default_method_falls_back_to_first() {
        let methods = TanMethods {
            methods: vec![method("900", false), method("920", true)],
            default_method_code: Some("999".to_string()),
        };
        assert_eq!(methods.default_method().unwrap().code, "900");
        assert!(TanMethods::default().default_method().is_none());
    }

    #[test]
    fn test_draft_debug_redacts_secret() {
        let draft = BankCredentialDraft {
            routing_code: "12345678".to_string(),
            login: "alice".to_string(),
            secret: "hunter2".to_string(),
            ..Default::default()
        };
        let debug = format!("{draft:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("***"));
        let json = serde_json::to_string(&draft).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_discard_clears_everything() {
        let mut draft = BankCredentialDraft {
            routing_code: "12345678".to_string(),
            login: "alice".to_string(),
            secret: "hunter2".to_string(),
            tan_method: Some("920".to_string()),
            tan_medium: Some("Phone".to_string()),
        };
        draft.discard();
        assert_eq!(draft, BankCredentialDraft::default());
    }
}
