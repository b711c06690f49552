//! Carbon-copy routing-key matchers.
//!
//! Both Taskcluster-backed families pre-filter on the carbon-copy keys
//! attached to a delivery before touching the body, so irrelevant
//! messages are dropped without a secondary fetch.

use once_cell::sync::Lazy;
use regex::Regex;

// Keys of interest look like:
//   index.funsize.v1.mozilla-central.latest.win32.4.5.balrog
static UPDATE_CC_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r".*funsize.*\.v1\.(?P<tree>.*)\.latest\.(?P<platform>.*?)\..*\.balrog")
        .expect("Failed to compile update routing-key pattern")
});

// Keys of interest look like:
//   route.index.releases.v1.mozilla-beta.latest.firefox.latest.beetmover.en_US.win64 (en-US)
//   route.index.releases.v1.mozilla-beta.latest.firefox.latest.beetmover.1.win64 (l10n repack)
static RELEASE_CC_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r".*releases\.v1\.(?P<tree>.*)\.latest\.firefox\.latest\.beetmover.*")
        .expect("Failed to compile release routing-key pattern")
});

/// Fields extracted from a funsize carbon-copy key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateKeyMatch {
    pub tree: String,
    pub platform: String,
}

/// Fields extracted from a beetmover carbon-copy key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseKeyMatch {
    pub tree: String,
}

/// Match one carbon-copy key against the funsize pattern.
pub fn match_update_cc(key: &str) -> Option<UpdateKeyMatch> {
    let caps = UPDATE_CC_REGEX.captures(key)?;
    Some(UpdateKeyMatch {
        tree: caps["tree"].to_string(),
        platform: caps["platform"].to_string(),
    })
}

/// Match one carbon-copy key against the beetmover pattern.
pub fn match_release_cc(key: &str) -> Option<ReleaseKeyMatch> {
    let caps = RELEASE_CC_REGEX.captures(key)?;
    Some(ReleaseKeyMatch {
        tree: caps["tree"].to_string(),
    })
}
