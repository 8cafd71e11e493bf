//! Network/client identity characteristics observed on a session.

use serde::{Deserialize, Serialize};

/// Snapshot of the client identity a session presents to the network.
///
/// Captured from a live page (user-agent plus client-hint headers) and
/// retained on the slot after the session closes, so late queries still see
/// the identity the last token was produced under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Full user-agent string. Empty until first capture.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accept_language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sec_ch_ua: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sec_ch_ua_mobile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sec_ch_ua_platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

impl Fingerprint {
    /// Merge a newer (possibly partial) capture into this snapshot.
    ///
    /// Only non-empty fields of `newer` replace prior values. A page that
    /// reports just a user-agent never erases client hints recorded earlier.
    pub fn merge(&mut self, newer: Fingerprint) {
        if !newer.user_agent.is_empty() {
            self.user_agent = newer.user_agent;
        }
        merge_field(&mut self.accept_language, newer.accept_language);
        merge_field(&mut self.sec_ch_ua, newer.sec_ch_ua);
        merge_field(&mut self.sec_ch_ua_mobile, newer.sec_ch_ua_mobile);
        merge_field(&mut self.sec_ch_ua_platform, newer.sec_ch_ua_platform);
        merge_field(&mut self.proxy_url, newer.proxy_url);
    }

    pub fn is_empty(&self) -> bool {
        self == &Fingerprint::default()
    }
}

fn merge_field(current: &mut Option<String>, newer: Option<String>) {
    if let Some(value) = newer
        && !value.is_empty()
    {
        *current = Some(value);
    }
}
