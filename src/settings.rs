//! Settings store and page skip evaluation

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::watch;
use tracing::debug;

use crate::config::Config;

/// Hosts the detector stays away from unless the user edits the list
pub const DEFAULT_BLACKLIST: &[&str] = &[
    "youtube.com",
    "studio.youtube.com",
    "vimeo.com",
    "twitch.tv",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub enabled: bool,
    pub blacklist: BTreeSet<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            blacklist: DEFAULT_BLACKLIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            enabled: config.enabled,
            blacklist: config.blacklist.iter().cloned().collect(),
        }
    }
}

/// User-controlled detector settings
pub trait SettingsStore: Send + Sync {
    fn get_enabled(&self) -> bool;

    fn get_blacklist(&self) -> BTreeSet<String>;

    /// Change notifications; the receiver always holds the latest snapshot
    fn subscribe(&self) -> watch::Receiver<Settings>;
}

/// Process-local settings backed by a watch channel
pub struct InMemorySettings {
    tx: watch::Sender<Settings>,
}

impl InMemorySettings {
    pub fn new(settings: Settings) -> Self {
        let (tx, _rx) = watch::channel(settings);
        Self { tx }
    }

    pub fn set_enabled(&self, enabled: bool) {
        debug!(enabled, "Updating enabled setting");
        self.tx.send_if_modified(|settings| {
            let changed = settings.enabled != enabled;
            settings.enabled = enabled;
            changed
        });
    }

    pub fn set_blacklist<I, S>(&self, hosts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let blacklist: BTreeSet<String> = hosts.into_iter().map(Into::into).collect();
        self.tx.send_modify(|settings| settings.blacklist = blacklist);
    }
}

impl Default for InMemorySettings {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl SettingsStore for InMemorySettings {
    fn get_enabled(&self) -> bool {
        self.tx.borrow().enabled
    }

    fn get_blacklist(&self) -> BTreeSet<String> {
        self.tx.borrow().blacklist.clone()
    }

    fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }
}

/// Lowercased host of an absolute URL, without userinfo or port.
pub fn hostname(url: &str) -> Option<String> {
    let (scheme, rest) = url.trim().split_once("://")?;
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c)) {
        return None;
    }

    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, h)| h);

    let host = if let Some(bracketed) = host_port.strip_prefix('[') {
        // IPv6 literal
        bracketed.split_once(']')?.0
    } else {
        host_port.split(':').next().unwrap_or_default()
    };

    if host.is_empty() || host.contains(char::is_whitespace) {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

/// Whether `url`'s host equals a listed host or is a subdomain of one.
/// Unparsable URLs are never blacklisted.
pub fn is_blacklisted<'a, I>(url: &str, blacklist: I) -> bool
where
    I: IntoIterator<Item = &'a String>,
{
    let Some(host) = hostname(url) else {
        return false;
    };

    blacklist.into_iter().any(|pattern| {
        let pattern = pattern.trim().to_ascii_lowercase();
        !pattern.is_empty()
            && (host == pattern
                || host
                    .strip_suffix(pattern.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.')))
    })
}

/// Detection is skipped when disabled or when the page host is blacklisted
pub fn should_skip(store: &dyn SettingsStore, url: &str) -> bool {
    !store.get_enabled() || is_blacklisted(url, &store.get_blacklist())
}
