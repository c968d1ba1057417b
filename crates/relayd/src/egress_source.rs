use anyhow::Context;
use gcd::Gcd;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

pub const UNSPECIFIED: &str = "unspecified";

/// A sending identity: the local address to bind and the name to
/// announce in EHLO.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VirtualMta {
    /// Give it a friendly name for use in reporting and referencing
    /// elsewhere in the config
    pub name: String,

    /// Bind to this local address prior to issuing a connect(2) syscall
    #[serde(default)]
    pub source_address: Option<IpAddr>,

    /// Specify the ehlo domain that should be used when sending from
    /// this source
    #[serde(default)]
    pub ehlo_domain: Option<String>,

    /// Override the default destination port number with this value
    /// for deployments that use port mapping
    #[serde(default)]
    pub remote_port: Option<u16>,
}

impl VirtualMta {
    pub fn unspecified() -> Self {
        Self {
            name: UNSPECIFIED.to_string(),
            source_address: None,
            ehlo_domain: None,
            remote_port: None,
        }
    }

    /// The address used to key rules, throttles and pools. A source
    /// that lets the kernel pick its address is keyed as 0.0.0.0.
    pub fn key_ip(&self) -> IpAddr {
        self.source_address
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn ehlo_name(&self) -> String {
        match &self.ehlo_domain {
            Some(n) => n.to_string(),
            None => gethostname::gethostname()
                .to_str()
                .unwrap_or("[127.0.0.1]")
                .to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VirtualMtaGroupEntry {
    /// Name of a VirtualMta to include in this group
    pub name: String,

    /// Weight of this entry in the group. If all entries have the same
    /// weight, then they have equal chance of being selected.
    /// If one entry has a weight that is twice that of the other
    /// entry in the group, then it is twice as likely to be selected
    /// as the other one.
    ///
    /// A weight of 0 prevents this entry from being used.
    #[serde(default = "VirtualMtaGroupEntry::default_weight")]
    pub weight: u32,
}

impl VirtualMtaGroupEntry {
    fn default_weight() -> u32 {
        1
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VirtualMtaGroup {
    /// Name of the group
    pub name: String,

    /// and the vmtas that constitute this group
    pub entries: Vec<VirtualMtaGroupEntry>,
}

impl VirtualMtaGroup {
    pub fn unspecified() -> Self {
        Self {
            name: UNSPECIFIED.to_string(),
            entries: vec![VirtualMtaGroupEntry {
                name: UNSPECIFIED.to_string(),
                weight: 1,
            }],
        }
    }
}

#[derive(Debug, Default)]
struct RoundRobinState {
    current_index: usize,
    current_weight: u32,
}

/// Maintains the state to manage Weighted Round Robin
/// <http://kb.linuxvirtualserver.org/wiki/Weighted_Round-Robin_Scheduling>
#[derive(Debug)]
pub struct GroupRoundRobin {
    pub name: String,
    entries: Vec<VirtualMtaGroupEntry>,
    max_weight: u32,
    gcd: u32,
    state: Mutex<RoundRobinState>,
}

impl GroupRoundRobin {
    pub fn new(group: &VirtualMtaGroup) -> Self {
        let entries: Vec<_> = group
            .entries
            .iter()
            .filter(|entry| entry.weight > 0)
            .cloned()
            .collect();

        let mut max_weight = 0;
        let mut gcd = 0;
        for entry in &entries {
            max_weight = max_weight.max(entry.weight);
            gcd = gcd.gcd(entry.weight);
        }

        Self {
            name: group.name.to_string(),
            entries,
            max_weight,
            gcd,
            state: Mutex::new(RoundRobinState::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next(&self) -> Option<&str> {
        if self.entries.len() == 1 {
            return self.entries.first().map(|entry| entry.name.as_str());
        }
        if self.max_weight == 0 {
            return None;
        }

        let mut state = self.state.lock();
        loop {
            state.current_index = (state.current_index + 1) % self.entries.len();
            if state.current_index == 0 {
                state.current_weight = state.current_weight.saturating_sub(self.gcd);
                if state.current_weight == 0 {
                    state.current_weight = self.max_weight;
                }
            }

            if let Some(entry) = self.entries.get(state.current_index) {
                if entry.weight >= state.current_weight {
                    return Some(entry.name.as_str());
                }
            }
        }
    }
}

/// The configured vmtas and groups, resolved once at startup
#[derive(Debug)]
pub struct EgressSources {
    vmtas: HashMap<String, Arc<VirtualMta>>,
    groups: HashMap<String, GroupRoundRobin>,
}

impl EgressSources {
    /// Validate and index the configuration. When no group named
    /// `unspecified` is configured, one is synthesized that sends
    /// from the kernel-selected address.
    pub fn new(vmtas: &[VirtualMta], groups: &[VirtualMtaGroup]) -> anyhow::Result<Self> {
        let mut by_name = HashMap::new();
        for vmta in vmtas {
            if by_name
                .insert(vmta.name.to_string(), Arc::new(vmta.clone()))
                .is_some()
            {
                anyhow::bail!("vmta '{}' is defined more than once", vmta.name);
            }
        }

        let mut rr = HashMap::new();
        for group in groups {
            for entry in &group.entries {
                if !by_name.contains_key(&entry.name) {
                    if entry.name == UNSPECIFIED {
                        by_name.insert(UNSPECIFIED.to_string(), Arc::new(VirtualMta::unspecified()));
                        continue;
                    }
                    anyhow::bail!(
                        "vmta_group '{}' references unknown vmta '{}'",
                        group.name,
                        entry.name
                    );
                }
            }
            let robin = GroupRoundRobin::new(group);
            if robin.is_empty() {
                anyhow::bail!("vmta_group '{}' has no entries with a non-zero weight", group.name);
            }
            if rr.insert(group.name.to_string(), robin).is_some() {
                anyhow::bail!("vmta_group '{}' is defined more than once", group.name);
            }
        }

        if !rr.contains_key(UNSPECIFIED) {
            by_name
                .entry(UNSPECIFIED.to_string())
                .or_insert_with(|| Arc::new(VirtualMta::unspecified()));
            rr.insert(
                UNSPECIFIED.to_string(),
                GroupRoundRobin::new(&VirtualMtaGroup::unspecified()),
            );
        }

        Ok(Self {
            vmtas: by_name,
            groups: rr,
        })
    }

    pub fn vmta(&self, name: &str) -> Option<&Arc<VirtualMta>> {
        self.vmtas.get(name)
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    /// Choose the sending identity for the next attempt from `group`
    pub fn select(&self, group: Option<&str>) -> anyhow::Result<Arc<VirtualMta>> {
        let group_name = group.unwrap_or(UNSPECIFIED);
        let group = self
            .groups
            .get(group_name)
            .with_context(|| format!("vmta_group '{group_name}' is not defined"))?;
        let name = group
            .next()
            .with_context(|| format!("vmta_group '{group_name}' has no usable entries"))?;
        self.vmtas
            .get(name)
            .cloned()
            .with_context(|| format!("vmta '{name}' is not defined"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(name: &str, weight: u32) -> VirtualMtaGroupEntry {
        VirtualMtaGroupEntry {
            name: name.to_string(),
            weight,
        }
    }

    fn vmta(name: &str, ip: &str) -> VirtualMta {
        VirtualMta {
            name: name.to_string(),
            source_address: Some(ip.parse().unwrap()),
            ehlo_domain: Some(format!("{name}.example.com")),
            remote_port: None,
        }
    }

    #[test]
    fn round_robin() {
        let group = VirtualMtaGroup {
            name: "group".to_string(),
            entries: vec![entry("one", 5), entry("two", 2), entry("three", 3)],
        };

        let rr = GroupRoundRobin::new(&group);
        let mut counts = HashMap::new();

        for _ in 0..100 {
            let name = rr.next().unwrap();
            *counts.entry(name.to_string()).or_insert(0) += 1;
        }

        // Counts should be in the same proportion as the
        // weights of the respective entries
        assert_eq!(counts["one"], 50, "one");
        assert_eq!(counts["two"], 20, "two");
        assert_eq!(counts["three"], 30, "three");
    }

    #[test]
    fn zero_weight_is_skipped() {
        let group = VirtualMtaGroup {
            name: "group".to_string(),
            entries: vec![entry("one", 0), entry("two", 1)],
        };
        let rr = GroupRoundRobin::new(&group);
        k9::assert_equal!(rr.len(), 1);
        for _ in 0..5 {
            k9::assert_equal!(rr.next(), Some("two"));
        }
    }

    #[test]
    fn selection() {
        let sources = EgressSources::new(
            &[vmta("a", "10.0.0.1"), vmta("b", "10.0.0.2")],
            &[VirtualMtaGroup {
                name: "bulk".to_string(),
                entries: vec![entry("a", 1), entry("b", 1)],
            }],
        )
        .unwrap();

        let first = sources.select(Some("bulk")).unwrap();
        let second = sources.select(Some("bulk")).unwrap();
        assert_ne!(first.name, second.name);

        let default = sources.select(None).unwrap();
        k9::assert_equal!(default.name, UNSPECIFIED);
        k9::assert_equal!(default.key_ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        assert!(sources.select(Some("missing")).is_err());
    }

    #[test]
    fn validation() {
        let err = EgressSources::new(
            &[],
            &[VirtualMtaGroup {
                name: "bulk".to_string(),
                entries: vec![entry("nope", 1)],
            }],
        )
        .unwrap_err();
        k9::assert_equal!(
            err.to_string(),
            "vmta_group 'bulk' references unknown vmta 'nope'"
        );

        assert!(EgressSources::new(&[vmta("a", "10.0.0.1"), vmta("a", "10.0.0.2")], &[]).is_err());
    }
}
