//! API credential as carried in element 1 of every request.
//!
//! The wire form is `key` or `key:organization`.

use std::fmt;

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub api_key: String,
    pub organization: Option<String>,
}

impl Credential {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            organization: None,
        }
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        let organization = organization.into();
        self.organization = (!organization.is_empty()).then_some(organization);
        self
    }

    /// Split at the first `:`. An empty organization counts as none.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((key, org)) => Self::new(key).with_organization(org),
            None => Self::new(raw),
        }
    }

    pub fn to_wire(&self) -> String {
        match &self.organization {
            Some(org) => format!("{}:{}", self.api_key, org),
            None => self.api_key.clone(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("api_key", &"<redacted>")
            .field("organization", &self.organization)
            .finish()
    }
}
