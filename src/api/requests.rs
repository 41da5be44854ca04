use serde::{Deserialize, Serialize};

/// Query for `GET /idempotency/stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsQuery {
    pub provider: Option<String>,
}

/// Query for `GET /idempotency/records/:provider/:id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordQuery {
    pub context: Option<String>,
}

impl RecordQuery {
    /// Blank contexts are treated as absent, matching key generation.
    pub fn context(&self) -> Option<&str> {
        self.context
            .as_deref()
            .filter(|c| !c.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_context_is_absent() {
        let query = RecordQuery {
            context: Some("   ".to_string()),
        };
        assert_eq!(query.context(), None);

        let query = RecordQuery {
            context: Some("refund".to_string()),
        };
        assert_eq!(query.context(), Some("refund"));
    }
}
