//! Which workers to ask, and in what order.

use rand::seq::SliceRandom;

use crate::config::{PeerOrder, StoreConfig};

/// Bounded walk over trusted peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Most peers asked to seal one chunk
    pub max_attempts: usize,
    /// Order in which trusted peers are asked
    pub order: PeerOrder,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            order: PeerOrder::Configured,
        }
    }
}

impl RetryPolicy {
    /// Policy from the `[store]` section
    pub fn from_config(store: &StoreConfig) -> Self {
        Self {
            max_attempts: store.max_peer_attempts.max(1),
            order: store.peer_order,
        }
    }

    /// Trusted peers that are currently known, at most `max_attempts` of them
    pub fn candidates(&self, known: &[String], trusted: &[String]) -> Vec<String> {
        let mut peers = self.reachable(known, trusted);
        peers.truncate(self.max_attempts);
        peers
    }

    /// Candidates for opening a chunk, with its custodian first
    ///
    /// Only the custodian holds the key, but every other reachable trusted
    /// peer is still asked so a moved or renamed worker can answer. The
    /// upload attempt bound does not apply here.
    pub fn decrypt_candidates(
        &self,
        custodian: Option<&str>,
        known: &[String],
        trusted: &[String],
    ) -> Vec<String> {
        let mut peers = self.reachable(known, trusted);
        if let Some(position) = custodian.and_then(|c| peers.iter().position(|p| p == c)) {
            let custodian = peers.remove(position);
            peers.insert(0, custodian);
        }
        peers
    }

    fn reachable(&self, known: &[String], trusted: &[String]) -> Vec<String> {
        let mut peers: Vec<String> = trusted
            .iter()
            .filter(|peer| known.contains(peer))
            .cloned()
            .collect();
        if self.order == PeerOrder::Shuffled {
            peers.shuffle(&mut rand::thread_rng());
        }
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_candidates_follow_configured_order() {
        let policy = RetryPolicy {
            max_attempts: 10,
            order: PeerOrder::Configured,
        };
        let known = ids(&["c", "a", "x"]);
        let trusted = ids(&["a", "b", "c"]);

        assert_eq!(policy.candidates(&known, &trusted), ids(&["a", "c"]));
    }

    #[test]
    fn test_candidates_bounded_by_attempts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            order: PeerOrder::Configured,
        };
        let peers = ids(&["a", "b", "c", "d"]);
        assert_eq!(policy.candidates(&peers, &peers), ids(&["a", "b"]));
    }

    #[test]
    fn test_shuffled_candidates_are_a_permutation() {
        let policy = RetryPolicy {
            max_attempts: 10,
            order: PeerOrder::Shuffled,
        };
        let peers = ids(&["a", "b", "c", "d", "e"]);
        let mut got = policy.candidates(&peers, &peers);
        got.sort();
        assert_eq!(got, peers);
    }

    #[test]
    fn test_untrusted_peers_never_chosen() {
        let policy = RetryPolicy::default();
        assert!(policy.candidates(&ids(&["evil"]), &ids(&["good"])).is_empty());
    }

    #[test]
    fn test_decrypt_candidates_start_with_custodian() {
        let policy = RetryPolicy {
            max_attempts: 3,
            order: PeerOrder::Configured,
        };
        let known = ids(&["a", "b", "c"]);
        let trusted = ids(&["a", "b", "c"]);

        assert_eq!(
            policy.decrypt_candidates(Some("b"), &known, &trusted),
            ids(&["b", "a", "c"])
        );
        // Unreachable custodian is skipped
        assert_eq!(
            policy.decrypt_candidates(Some("z"), &known, &trusted),
            ids(&["a", "b", "c"])
        );
    }

    #[test]
    fn test_decrypt_candidates_only_trusted() {
        let policy = RetryPolicy::default();
        let known = ids(&["old", "a", "b"]);

        // A custodian dropped from the trusted list is never asked
        assert_eq!(
            policy.decrypt_candidates(Some("old"), &known, &ids(&["a", "b"])),
            ids(&["a", "b"])
        );
    }

    #[test]
    fn test_decrypt_candidates_ignore_attempt_bound() {
        let policy = RetryPolicy {
            max_attempts: 1,
            order: PeerOrder::Configured,
        };
        let peers = ids(&["a", "b", "c", "d"]);

        assert_eq!(
            policy.decrypt_candidates(Some("c"), &peers, &peers),
            ids(&["c", "a", "b", "d"])
        );
        assert_eq!(policy.candidates(&peers, &peers), ids(&["a"]));
    }
}
