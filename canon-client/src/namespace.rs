//! Session id namespace
//!
//! Every session this client owns has an id of the form
//! `<prefix><profile>-<suffix>`. Ids without the prefix belong to other
//! consumers of a shared backend and are invisible to this client.

use uuid::Uuid;

/// Fallback profile when none is supplied or inferable
pub const DEFAULT_PROFILE: &str = "default";

/// The id prefix identifying sessions owned by this client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether `id` belongs to this client
    pub fn owns(&self, id: &str) -> bool {
        id.len() > self.prefix.len() && id.starts_with(&self.prefix)
    }

    /// Mint a fresh id for a session running `profile`
    pub fn new_id(&self, profile: &str) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}{}-{}", self.prefix, slug(profile), &suffix[..12])
    }

    /// Profile encoded in an owned id, if any
    pub fn infer_profile(&self, id: &str) -> Option<String> {
        let rest = id.strip_prefix(&self.prefix)?;
        let (profile, suffix) = rest.rsplit_once('-')?;
        if profile.is_empty() || suffix.is_empty() {
            return None;
        }
        Some(profile.to_string())
    }

    /// Default display name for an owned id
    ///
    /// `canon-shell-3f2a` becomes `Shell 3f2a`; an id that does not follow
    /// the convention shows its un-prefixed remainder.
    pub fn infer_display_name(&self, id: &str) -> String {
        let rest = id.strip_prefix(&self.prefix).unwrap_or(id);
        match (self.infer_profile(id), rest.rsplit_once('-')) {
            (Some(profile), Some((_, suffix))) => format!("{} {}", title_case(&profile), suffix),
            _ => rest.to_string(),
        }
    }
}

fn slug(profile: &str) -> String {
    let slug: String = profile
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if slug.is_empty() {
        DEFAULT_PROFILE.to_string()
    } else {
        slug
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
