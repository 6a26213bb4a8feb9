use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::LazyLock;

use mailparse::{MailAddr, MailHeaderMap};
use regex::Regex;
use serde::{Deserialize, Serialize};

static ANGLE_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^<>\s]+)>").expect("valid angle address regex"));

/// Aggregated sender statistics as persisted in the directory store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderRecord {
    #[serde(default)]
    pub name: String,
    pub frequency: u64,
}

/// One sender as shown to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sender {
    pub address: String,
    pub name: String,
    pub frequency: u64,
}

impl Sender {
    /// Whether the address or name contains `query`, ignoring case. An empty query
    /// matches everyone.
    pub fn matches(&self, query: &str) -> bool {
        let needle = query.trim().to_lowercase();
        needle.is_empty()
            || self.address.contains(&needle)
            || self.name.to_lowercase().contains(&needle)
    }
}

/// The origin of one message: a normalized address and its decoded display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSender {
    pub address: String,
    pub name: String,
}

/// Address-keyed sender statistics. Merging is commutative and associative, so
/// partial directories built by concurrent workers can be combined in any order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SenderDirectory {
    entries: BTreeMap<String, SenderRecord>,
}

impl SenderDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, address: &str) -> Option<&SenderRecord> {
        self.entries.get(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.entries.contains_key(address)
    }

    /// Count one message from `sender`.
    pub fn record(&mut self, sender: ParsedSender) {
        self.add(sender.address, sender.name, 1);
    }

    fn add(&mut self, address: String, name: String, frequency: u64) {
        match self.entries.get_mut(&address) {
            Some(existing) => {
                existing.frequency = existing.frequency.saturating_add(frequency);
                if prefer_name(&name, &existing.name) {
                    existing.name = name;
                }
            }
            None => {
                self.entries.insert(address, SenderRecord { name, frequency });
            }
        }
    }

    /// Fold `other` into `self`, summing frequencies.
    pub fn merge(&mut self, other: SenderDirectory) {
        for (address, record) in other.entries {
            self.add(address, record.name, record.frequency);
        }
    }

    pub fn merge_all(partials: impl IntoIterator<Item = SenderDirectory>) -> Self {
        partials
            .into_iter()
            .fold(SenderDirectory::new(), |mut acc, partial| {
                acc.merge(partial);
                acc
            })
    }

    pub fn remove(&mut self, address: &str) -> Option<SenderRecord> {
        self.entries.remove(&normalize_address(address))
    }

    pub fn iter(&self) -> impl Iterator<Item = Sender> + '_ {
        self.entries.iter().map(|(address, record)| Sender {
            address: address.clone(),
            name: record.name.clone(),
            frequency: record.frequency,
        })
    }

    /// All senders ordered by `key`, see [`sort_senders`].
    pub fn sorted(&self, key: SortKey, order: SortOrder) -> Vec<Sender> {
        let mut senders: Vec<Sender> = self.iter().collect();
        sort_senders(&mut senders, key, order);
        senders
    }

    /// Senders whose address or name contains `query`, ignoring case.
    pub fn search(&self, query: &str) -> Vec<Sender> {
        self.iter().filter(|sender| sender.matches(query)).collect()
    }

    /// Senders whose address appears in `addresses`.
    pub fn restricted_to<'a>(&self, addresses: impl IntoIterator<Item = &'a str>) -> Vec<Sender> {
        let mut picked: Vec<Sender> = addresses
            .into_iter()
            .map(normalize_address)
            .filter_map(|address| {
                self.entries.get(&address).map(|record| Sender {
                    address,
                    name: record.name.clone(),
                    frequency: record.frequency,
                })
            })
            .collect();
        picked.sort_by(|a, b| a.address.cmp(&b.address));
        picked.dedup_by(|a, b| a.address == b.address);
        picked
    }
}

/// Order `senders` by `key`. Senders without a name sort last in either direction
/// when ordering by name; ties fall back to the address.
pub fn sort_senders(senders: &mut [Sender], key: SortKey, order: SortOrder) {
    senders.sort_by(|a, b| {
        let primary = match key {
            SortKey::Address => order.apply(a.address.cmp(&b.address)),
            SortKey::Frequency => order.apply(a.frequency.cmp(&b.frequency)),
            SortKey::Name => match (a.name.is_empty(), b.name.is_empty()) {
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                _ => order.apply(a.name.to_lowercase().cmp(&b.name.to_lowercase())),
            },
        };
        primary.then_with(|| a.address.cmp(&b.address))
    });
}

/// Deterministic name choice: any name beats none, otherwise the smaller one wins.
fn prefer_name(candidate: &str, current: &str) -> bool {
    match (candidate.is_empty(), current.is_empty()) {
        (true, _) => false,
        (false, true) => true,
        (false, false) => candidate < current,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Address,
    Name,
    Frequency,
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "address" | "email" => Ok(SortKey::Address),
            "name" => Ok(SortKey::Name),
            "frequency" | "count" => Ok(SortKey::Frequency),
            other => Err(format!("unknown sort key: {other}")),
        }
    }
}

/// Ascending always means smallest first, including for frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    fn apply(&self, ordering: Ordering) -> Ordering {
        match self {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    }
}

pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Whether `address` looks like `local@domain.tld` with no whitespace.
pub fn is_valid_address(address: &str) -> bool {
    let Some((local, domain)) = address.rsplit_once('@') else {
        return false;
    };
    !local.is_empty()
        && !local.contains('@')
        && !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !address.chars().any(|c| c.is_whitespace() || c == '<' || c == '>')
}

/// Pull the address out of a `From` value.
///
/// Values that do not parse as an address list are retried as `<value>` so a bare
/// address that upset the parser is still recovered.
pub fn extract_address(value: &str) -> Option<ParsedSender> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(list) = mailparse::addrparse(value) {
        let single = list.iter().find_map(|addr| match addr {
            MailAddr::Single(info) => Some(info.clone()),
            MailAddr::Group(group) => group.addrs.first().cloned(),
        });
        if let Some(info) = single {
            let address = normalize_address(&info.addr);
            if is_valid_address(&address) {
                return Some(ParsedSender {
                    address,
                    name: info.display_name.unwrap_or_default().trim().to_string(),
                });
            }
        }
    }

    if let Some(captures) = ANGLE_ADDRESS.captures(value) {
        let address = normalize_address(&captures[1]);
        if is_valid_address(&address) {
            let name = value[..captures.get(0).map_or(0, |m| m.start())]
                .trim()
                .trim_matches('"')
                .trim()
                .to_string();
            return Some(ParsedSender { address, name });
        }
    }

    let rewrapped = format!("<{}>", value.trim_matches(|c| c == '<' || c == '>'));
    ANGLE_ADDRESS
        .captures(&rewrapped)
        .map(|captures| normalize_address(&captures[1]))
        .filter(|address| is_valid_address(address))
        .map(|address| ParsedSender {
            address,
            name: String::new(),
        })
}

/// Parse the `From` header out of a raw header block (or full message).
pub fn parse_sender(raw_headers: &[u8]) -> Option<ParsedSender> {
    let (headers, _) = mailparse::parse_headers(raw_headers).ok()?;
    let from = headers.get_first_value("From")?;
    extract_address(&from)
}
