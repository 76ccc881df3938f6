use crate::session::SessionKey;

/// Outcome of a `chat_info` event for a session currently keyed by `current`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Binding {
    /// Ephemeral session receiving its server id: relocate the entry
    Migrate { from: SessionKey, to: SessionKey },
    /// Already bound to this id; only metadata changes
    Unchanged,
    /// Already bound to a different id. A key binds once, so this is ignored.
    Conflict { bound: String, assigned: String },
}

/// Decide what a server-assigned id means for `current`.
pub fn bind(current: &SessionKey, assigned: &str) -> Binding {
    match current {
        SessionKey::Ephemeral(_) => Binding::Migrate {
            from: current.clone(),
            to: SessionKey::bound(assigned),
        },
        SessionKey::Bound(id) if id == assigned => Binding::Unchanged,
        SessionKey::Bound(id) => Binding::Conflict {
            bound: id.clone(),
            assigned: assigned.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_key_migrates() {
        let temp = SessionKey::Ephemeral("tmp".into());
        let binding = bind(&temp, "abc");
        assert_eq!(
            binding,
            Binding::Migrate {
                from: temp.clone(),
                to: SessionKey::bound("abc")
            }
        );
    }

    #[test]
    fn test_second_chat_info_is_noop() {
        let bound = SessionKey::bound("abc");
        assert_eq!(bind(&bound, "abc"), Binding::Unchanged);
    }

    #[test]
    fn test_bound_key_never_rebinds() {
        let bound = SessionKey::bound("abc");
        assert!(matches!(bind(&bound, "xyz"), Binding::Conflict { .. }));
    }
}
