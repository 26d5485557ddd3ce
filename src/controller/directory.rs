//! Host directory resolution.
//!
//! A shared ConfigMap publishes the externally reachable `host:port` for
//! every member, one newline-delimited list for data members (`datas`) and
//! one for arbiters (`arbiters`), each entry shaped like
//! `_id:0,host:'10.29.5.103:31029'`. The multi-cluster layer owns writing
//! that object; this module only parses it into ordered member descriptors.

use k8s_openapi::api::core::v1::ConfigMap;
use tracing::warn;

use crate::client::types::{MAX_MEMBERS, MAX_VOTING_MEMBERS, Member};

pub const DATA_HOSTS_KEY: &str = "datas";
pub const ARBITER_HOSTS_KEY: &str = "arbiters";

/// Which members the caller is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveScope<'a> {
    /// The full desired membership, e.g. for `rs.initiate`.
    All,
    /// Only the entry matching this pod's own externally visible
    /// `vip:nodePort` address.
    SelfAddr(&'a str),
}

/// Parsed host directory contents.
#[derive(Debug, Clone, Default)]
pub struct HostDirectory {
    pub data: String,
    pub arbiters: String,
}

impl HostDirectory {
    pub fn from_config_map(cm: &ConfigMap) -> Self {
        let get = |key: &str| {
            cm.data
                .as_ref()
                .and_then(|d| d.get(key))
                .cloned()
                .unwrap_or_default()
        };
        Self {
            data: get(DATA_HOSTS_KEY),
            arbiters: get(ARBITER_HOSTS_KEY),
        }
    }

    /// Ordered member descriptors for the directory.
    ///
    /// Data members come first with ids 0..; arbiter members are appended
    /// with ids continuing the counter. The first seven members in
    /// directory order hold `votes=1, priority=1`; everyone after that is
    /// non-voting. Entries beyond the 50-member cap are dropped with a
    /// warning. With `SelfAddr`, only the matching entry is returned
    /// (arbiter entries are considered only when `arbiter_enabled`).
    pub fn resolve(&self, arbiter_enabled: bool, scope: ResolveScope<'_>) -> Vec<Member> {
        let mut members = Vec::new();
        let mut position = 0usize;

        for host in parse_host_list(&self.data) {
            if position >= MAX_MEMBERS {
                warn!(host = %host, "dropping data entry beyond the member cap");
                continue;
            }
            let mut member = Member::data(host);
            member.id = position as i32;
            if position < MAX_VOTING_MEMBERS {
                member.votes = 1;
                member.priority = 1;
            }
            position += 1;
            members.push(member);
        }

        let want_arbiters = match scope {
            ResolveScope::All => true,
            ResolveScope::SelfAddr(_) => arbiter_enabled,
        };
        if want_arbiters {
            for host in parse_host_list(&self.arbiters) {
                if position >= MAX_MEMBERS {
                    warn!(host = %host, "dropping arbiter entry beyond the member cap");
                    continue;
                }
                let mut member = Member::arbiter(host);
                member.id = position as i32;
                if position < MAX_VOTING_MEMBERS {
                    member.votes = 1;
                    member.priority = 1;
                }
                position += 1;
                members.push(member);
            }
        }

        match scope {
            ResolveScope::All => members,
            ResolveScope::SelfAddr(addr) => {
                members.retain(|m| m.host == addr);
                members
            }
        }
    }

    /// All published data member addresses, used to dial the replica set.
    pub fn data_addresses(&self) -> Vec<String> {
        parse_host_list(&self.data)
    }

    /// The published arbiter address, if one is scheduled. The directory
    /// holds at most one arbiter entry per cluster.
    pub fn arbiter_host(&self) -> Option<String> {
        parse_host_list(&self.arbiters).into_iter().next()
    }
}

/// Parse one newline-delimited host list. Blank lines (typically one
/// trailing) are skipped, malformed entries are dropped with a warning.
fn parse_host_list(list: &str) -> Vec<String> {
    let mut hosts = Vec::new();
    for line in list.split('\n') {
        if line.is_empty() {
            continue;
        }
        match parse_host_entry(line) {
            Some(host) => hosts.push(host),
            None => warn!(entry = %line, "malformed host directory entry"),
        }
    }
    hosts
}

/// `_id:0,host:'10.29.5.103:31029'` → `10.29.5.103:31029`
fn parse_host_entry(entry: &str) -> Option<String> {
    let (_, rest) = entry.split_once("host:'")?;
    let host = rest.strip_suffix('\'')?;
    if host.is_empty() {
        return None;
    }
    Some(host.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn entries(n: usize, base: &str) -> String {
        (0..n)
            .map(|i| format!("_id:{},host:'{}.{}:27017'", i, base, i))
            .collect::<Vec<_>>()
            .join("\n")
            + "\n"
    }

    #[test]
    fn test_parse_host_entry() {
        assert_eq!(
            parse_host_entry("_id:0,host:'10.29.5.103:31029'"),
            Some("10.29.5.103:31029".to_string())
        );
        assert_eq!(parse_host_entry("host missing"), None);
        assert_eq!(parse_host_entry("_id:0,host:''"), None);
    }

    #[test]
    fn test_resolve_three_data_members() {
        let dir = HostDirectory {
            data: entries(3, "10.0.0"),
            arbiters: String::new(),
        };
        let members = dir.resolve(false, ResolveScope::All);

        assert_eq!(members.len(), 3);
        for (i, m) in members.iter().enumerate() {
            assert_eq!(m.id, i as i32);
            assert_eq!(m.votes, 1);
            assert_eq!(m.priority, 1);
            assert!(!m.arbiter_only);
            assert!(m.build_indexes);
        }
    }

    #[test]
    fn test_resolve_eight_data_members_vote_cap() {
        let dir = HostDirectory {
            data: entries(8, "10.0.0"),
            arbiters: String::new(),
        };
        let members = dir.resolve(false, ResolveScope::All);

        assert_eq!(members.len(), 8);
        let voters: Vec<_> = members.iter().filter(|m| m.votes == 1).collect();
        assert_eq!(voters.len(), 7);
        assert!(members[..7].iter().all(|m| m.votes == 1 && m.priority == 1));
        assert_eq!(members[7].votes, 0);
        assert_eq!(members[7].priority, 0);
    }

    #[test]
    fn test_resolve_arbiter_continues_ids_and_votes() {
        let dir = HostDirectory {
            data: entries(3, "10.0.0"),
            arbiters: "_id:0,host:'10.0.1.0:37017'\n".to_string(),
        };
        let members = dir.resolve(true, ResolveScope::All);

        assert_eq!(members.len(), 4);
        let arbiter = &members[3];
        assert!(arbiter.arbiter_only);
        assert_eq!(arbiter.id, 3);
        // Within the first seven overall, so it keeps its vote.
        assert_eq!(arbiter.votes, 1);
    }

    #[test]
    fn test_resolve_vote_cap_spans_data_and_arbiters() {
        let dir = HostDirectory {
            data: entries(7, "10.0.0"),
            arbiters: "_id:0,host:'10.0.1.0:37017'\n".to_string(),
        };
        let members = dir.resolve(true, ResolveScope::All);

        assert_eq!(members.len(), 8);
        assert_eq!(members.iter().filter(|m| m.votes == 1).count(), 7);
        // The arbiter is the eighth member and gets no vote.
        assert_eq!(members[7].votes, 0);
        assert!(members[7].arbiter_only);
    }

    #[test]
    fn test_resolve_drops_entries_beyond_cap() {
        let dir = HostDirectory {
            data: entries(52, "10.0.0"),
            arbiters: String::new(),
        };
        let members = dir.resolve(false, ResolveScope::All);
        assert_eq!(members.len(), MAX_MEMBERS);
    }

    #[test]
    fn test_resolve_self_scope() {
        let dir = HostDirectory {
            data: entries(3, "10.0.0"),
            arbiters: String::new(),
        };
        let members = dir.resolve(false, ResolveScope::SelfAddr("10.0.0.1:27017"));

        assert_eq!(members.len(), 1);
        assert_eq!(members[0].host, "10.0.0.1:27017");
        // Retains its directory position's vote assignment.
        assert_eq!(members[0].votes, 1);

        let none = dir.resolve(false, ResolveScope::SelfAddr("10.9.9.9:27017"));
        assert!(none.is_empty());
    }

    #[test]
    fn test_resolve_self_scope_ignores_arbiters_unless_enabled() {
        let dir = HostDirectory {
            data: entries(2, "10.0.0"),
            arbiters: "_id:0,host:'10.0.1.0:37017'\n".to_string(),
        };
        assert!(
            dir.resolve(false, ResolveScope::SelfAddr("10.0.1.0:37017"))
                .is_empty()
        );
        let members = dir.resolve(true, ResolveScope::SelfAddr("10.0.1.0:37017"));
        assert_eq!(members.len(), 1);
        assert!(members[0].arbiter_only);
    }

    #[test]
    fn test_trailing_blank_line_skipped() {
        let dir = HostDirectory {
            data: "_id:0,host:'10.0.0.0:27017'\n\n".to_string(),
            arbiters: String::new(),
        };
        assert_eq!(dir.data_addresses(), vec!["10.0.0.0:27017"]);
    }

    #[test]
    fn test_arbiter_host() {
        let dir = HostDirectory {
            data: String::new(),
            arbiters: "_id:4,host:'10.29.5.103:37496'\n".to_string(),
        };
        assert_eq!(dir.arbiter_host(), Some("10.29.5.103:37496".to_string()));
        assert_eq!(HostDirectory::default().arbiter_host(), None);
    }
}
