//! Cache lifetimes and paging limits.

use std::time::Duration;

const DEFAULT_FRESH_ENTITY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_BACKFILL_ENTITY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_COMMUNITY_RANKING_TTL: Duration = Duration::from_secs(60);
const DEFAULT_PAGE_CURSOR_LIFETIME: Duration = Duration::from_secs(4 * 60 * 60);
const DEFAULT_PAGE_SIZE: u32 = 2;
const DEFAULT_MAX_PAGE_SIZE: u32 = 50;

/// Runtime cache policy shared by the read, vote and ingest paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Lifetime of an entity hash warmed from a creation event.
    pub fresh_entity_ttl: Duration,
    /// Lifetime of an entity hash written back after an authoritative read.
    pub backfill_entity_ttl: Duration,
    /// Lifetime of a derived per-community rank set.
    pub community_ranking_ttl: Duration,
    /// How long a minted page cursor stays valid.
    pub page_cursor_lifetime: Duration,
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            fresh_entity_ttl: DEFAULT_FRESH_ENTITY_TTL,
            backfill_entity_ttl: DEFAULT_BACKFILL_ENTITY_TTL,
            community_ranking_ttl: DEFAULT_COMMUNITY_RANKING_TTL,
            page_cursor_lifetime: DEFAULT_PAGE_CURSOR_LIFETIME,
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }
}

impl From<&crate::config::CacheSettings> for CachePolicy {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            fresh_entity_ttl: settings.fresh_entity_ttl,
            backfill_entity_ttl: settings.backfill_entity_ttl,
            community_ranking_ttl: settings.community_ranking_ttl,
            page_cursor_lifetime: settings.page_cursor_lifetime,
            default_page_size: settings.default_page_size.get(),
            max_page_size: settings.max_page_size.get(),
        }
    }
}

impl CachePolicy {
    /// Clamp a requested page size into `1..=max_page_size`; zero falls back to the default.
    pub fn page_size(&self, requested: Option<u32>) -> u32 {
        match requested {
            Some(0) | None => self.default_page_size.clamp(1, self.max_page_size.max(1)),
            Some(size) => size.min(self.max_page_size.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let policy = CachePolicy::default();
        assert_eq!(policy.fresh_entity_ttl, Duration::from_secs(86_400));
        assert_eq!(policy.backfill_entity_ttl, Duration::from_secs(86_400));
        assert_eq!(policy.community_ranking_ttl, Duration::from_secs(60));
        assert_eq!(policy.page_cursor_lifetime, Duration::from_secs(14_400));
        assert_eq!(policy.default_page_size, 2);
        assert_eq!(policy.max_page_size, 50);
    }

    #[test]
    fn page_size_is_clamped() {
        let policy = CachePolicy::default();
        assert_eq!(policy.page_size(None), 2);
        assert_eq!(policy.page_size(Some(0)), 2);
        assert_eq!(policy.page_size(Some(10)), 10);
        assert_eq!(policy.page_size(Some(500)), 50);
    }
}
