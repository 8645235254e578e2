use crate::error::MdrError;

/// The caller of every service operation. Authentication happens outside the
/// core; handlers construct a `Principal` and pass it explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub actor_id: String,
    pub roles: Vec<String>,
}

impl Principal {
    /// Construct explicitly for in-process mode.
    /// There is no implicit or thread-local identity anywhere in the codebase.
    pub fn in_process(actor_id: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            roles,
        }
    }

    /// Convenience for tooling and tests: an admin principal.
    pub fn admin(actor_id: impl Into<String>) -> Self {
        Self::in_process(actor_id, vec!["admin".into()])
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role("admin")
    }

    pub fn require_admin(&self) -> Result<(), MdrError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(MdrError::Unauthorized(format!(
                "{} is not an admin",
                self.actor_id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_process_principal() {
        let p = Principal::in_process("bob", vec!["steward".into()]);
        assert_eq!(p.actor_id, "bob");
        assert!(p.has_role("steward"));
        assert!(!p.is_admin());
    }

    #[test]
    fn require_admin() {
        assert!(Principal::admin("root").require_admin().is_ok());
        let err = Principal::in_process("eve", vec![]).require_admin().unwrap_err();
        assert!(matches!(err, MdrError::Unauthorized(msg) if msg.contains("eve")));
    }
}
