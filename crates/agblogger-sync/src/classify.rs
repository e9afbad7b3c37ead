//! Per-path three-way classification.
//!
//! For each path the engine compares the client hash *C*, the server hash
//! *S*, and the merge-base hash *B* (the file at the client's
//! `last_sync_commit`, absent on first sync). The table in the module
//! tests is the contract; data preservation wins every delete/modify
//! race.

/// What the plan tells each side to do with one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// No change anywhere.
    Skip,
    /// Client → server.
    Upload,
    /// Server → client.
    Download,
    /// Client should delete its copy.
    DeleteClient,
    /// Server should delete its copy at COMMIT.
    DeleteServer,
    /// Both sides changed, differently: three-way merge at COMMIT.
    Conflict,
    /// Both sides changed identically; accept with no transfer.
    Coincident,
}

/// Classify one path from the three hashes.
pub fn classify(client: Option<&str>, server: Option<&str>, base: Option<&str>) -> Action {
    match (client, server) {
        (None, None) => Action::Skip,

        (Some(c), Some(s)) if c == s => {
            match base {
                // Unchanged everywhere.
                Some(b) if b == c => Action::Skip,
                // Both sides arrived at the same bytes independently.
                _ => Action::Coincident,
            }
        }

        (Some(c), Some(s)) => match base {
            Some(b) if c == b => Action::Download, // remote edit
            Some(b) if s == b => Action::Upload,   // local edit
            Some(_) => Action::Conflict,           // divergent edits
            // No base: conservative "server wins on differences".
            None => Action::Download,
        },

        (Some(c), None) => match base {
            // Server deleted an unchanged file: propagate the delete.
            Some(b) if c == b => Action::DeleteClient,
            // Modify/delete: the modified copy is preserved.
            Some(_) => Action::Upload,
            // Local-only path: upload even without a base.
            None => Action::Upload,
        },

        (None, Some(s)) => match base {
            // Client deleted an unchanged file: delete on the server.
            Some(b) if s == b => Action::DeleteServer,
            // Delete/modify: keep the server's modified copy.
            Some(_) => Action::Download,
            // Server-only path.
            None => Action::Download,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const A: Option<&str> = Some("aaaa");
    const B: Option<&str> = Some("bbbb");
    const C: Option<&str> = Some("cccc");
    const NONE: Option<&str> = None;

    /// The full classification table from the design, row by row.
    #[test]
    fn classification_table() {
        // C vs B equal, S vs B equal → no change.
        assert_eq!(classify(A, A, A), Action::Skip);
        // changed | equal → local edit.
        assert_eq!(classify(B, A, A), Action::Upload);
        // equal | changed → remote edit.
        assert_eq!(classify(A, B, A), Action::Download);
        // changed | changed identically → coincident.
        assert_eq!(classify(B, B, A), Action::Coincident);
        // changed | changed differently → conflict.
        assert_eq!(classify(B, C, A), Action::Conflict);
        // new | absent → local add.
        assert_eq!(classify(A, NONE, NONE), Action::Upload);
        // absent | new → remote add.
        assert_eq!(classify(NONE, A, NONE), Action::Download);
        // deleted | equal → delete on server.
        assert_eq!(classify(NONE, A, A), Action::DeleteServer);
        // equal | deleted → delete on client.
        assert_eq!(classify(A, NONE, A), Action::DeleteClient);
        // deleted | changed → keep modified (download it back).
        assert_eq!(classify(NONE, B, A), Action::Download);
        // changed | deleted → keep modified (upload it back).
        assert_eq!(classify(B, NONE, A), Action::Upload);
    }

    #[test]
    fn no_base_falls_back_to_server_wins() {
        // Differing content without a base: server wins.
        assert_eq!(classify(A, B, NONE), Action::Download);
        // Identical content without a base: coincident, nothing moves.
        assert_eq!(classify(A, A, NONE), Action::Coincident);
        // Local-only paths still upload.
        assert_eq!(classify(A, NONE, NONE), Action::Upload);
    }

    #[test]
    fn base_differing_from_both_is_conflict() {
        assert_eq!(classify(B, C, A), Action::Conflict);
        assert_eq!(classify(C, B, A), Action::Conflict);
    }

    proptest! {
        /// Every input is classified (totality) and both-absent is the
        /// only Skip without a base.
        #[test]
        fn classification_is_total(
            c in proptest::option::of("[a-d]"),
            s in proptest::option::of("[a-d]"),
            b in proptest::option::of("[a-d]"),
        ) {
            let action = classify(c.as_deref(), s.as_deref(), b.as_deref());
            if c.is_none() && s.is_none() {
                prop_assert_eq!(action, Action::Skip);
            }
            // Transfers never point at a side that has no file to send.
            if c.is_none() {
                prop_assert_ne!(action, Action::Upload);
            }
            if s.is_none() {
                prop_assert_ne!(action, Action::Download);
            }
        }
    }
}
