//! Capability contracts for the collaborators this crate drives but does not
//! implement: the page a surface shows, the host that opens surfaces, and the
//! durable alarm facility.

use autoread_protocol::{Command, Response};
use std::time::Duration;

use crate::channel::DeliveryError;
use crate::error::Result;

/// One unit inside an item, keyed by a strictly increasing integer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubItem {
    pub key: u64,
    /// Explicit read marker from the site, when the page exposes one.
    pub read_state: Option<bool>,
    pub new_badge: bool,
}

impl SubItem {
    pub fn new(key: u64) -> Self {
        Self {
            key,
            read_state: None,
            new_badge: false,
        }
    }
}

/// The page currently loaded in the executor's surface.
pub trait Page: Send {
    /// Current location: a full URL or an absolute path.
    fn location(&self) -> String;
    /// Item links on a listing page, in page order.
    fn item_links(&self) -> Vec<String>;
    /// Sub-items loaded so far on an item page. Order is not guaranteed.
    fn sub_items(&self) -> Vec<SubItem>;
    /// Highest sub-item key the site itself considers read, if it says.
    fn last_read_key(&self) -> Option<u64> {
        None
    }
    fn is_in_view(&self, item: &SubItem) -> bool;
    fn scroll_into_view(&mut self, item: &SubItem);
    /// Scrolls to the bottom, which may trigger loading more sub-items.
    fn scroll_to_end(&mut self);
    fn scroll_position(&self) -> i64;
    /// Cosmetic pointer movement.
    fn pointer_wiggle(&mut self);
    fn navigate(&mut self, url: &str);
    fn reload(&mut self);
}

/// Decides whether a sub-item still deserves a read delay.
pub trait UnreadPredicate: Send {
    fn is_unread(&self, item: &SubItem, site_last_read: Option<u64>) -> bool;
}

/// Fallback order: explicit read state, then the "new" badge, then the
/// site's last-read key. With none of those the item counts as unread.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicUnread;

impl UnreadPredicate for HeuristicUnread {
    fn is_unread(&self, item: &SubItem, site_last_read: Option<u64>) -> bool {
        if let Some(read) = item.read_state {
            return !read;
        }
        if item.new_badge {
            return true;
        }
        match site_last_read {
            Some(last) => item.key > last,
            None => true,
        }
    }
}

/// Scheduler-side control over surfaces.
pub trait SurfaceHost: Send + Sync {
    /// Opens a surface on `url` and returns its id.
    fn open_surface(&self, url: &str, active: bool) -> Result<String>;
    fn close_surface(&self, surface_id: &str) -> Result<()>;
    /// True once the surface has loaded and registered, false on timeout.
    fn wait_until_loaded(&self, surface_id: &str, timeout: Duration) -> bool;
    fn send_command(
        &self,
        surface_id: &str,
        command: &Command,
    ) -> std::result::Result<Response, DeliveryError>;
    fn surfaces(&self) -> Vec<String>;
}

/// Wall-clock alarms that survive restarts of the owning context.
pub trait Alarms: Send + Sync {
    fn schedule_once_at(&self, name: &str, when_ms: i64);
    fn schedule_repeating(&self, name: &str, first_ms: i64, period_ms: i64);
    fn cancel(&self, name: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_read_state_wins() {
        let item = SubItem {
            key: 5,
            read_state: Some(true),
            new_badge: true,
        };
        assert!(!HeuristicUnread.is_unread(&item, None));
    }

    #[test]
    fn badge_then_last_read_key() {
        let badged = SubItem {
            key: 1,
            read_state: None,
            new_badge: true,
        };
        assert!(HeuristicUnread.is_unread(&badged, Some(10)));

        assert!(!HeuristicUnread.is_unread(&SubItem::new(10), Some(10)));
        assert!(HeuristicUnread.is_unread(&SubItem::new(11), Some(10)));
        assert!(HeuristicUnread.is_unread(&SubItem::new(3), None));
    }
}
