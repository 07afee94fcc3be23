//! Traversal Engine.
//!
//! Walks the sub-items of one item in key order, resuming strictly after the
//! persisted high-water mark. The sequence grows underneath us (the page
//! loads more as we scroll), so it is re-read in full every round. The walk
//! ends after two consecutive rounds in which neither the sequence nor the
//! scroll position moved; the high-water mark is then cleared.
//!
//! Every wait is a potential exit: the host reports stops and quick mode, and
//! the page location is re-checked so that a surface which wandered off to a
//! different item aborts the walk instead of reading the wrong thing.

use crate::location::{check_location, ItemLocation, LocationCheck};
use crate::page::{Page, SubItem, UnreadPredicate};

pub const SETTLE_MS: u64 = 500;
pub const LOAD_GRACE_MS: u64 = 3_000;
pub const IDLE_ROUND_LIMIT: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    Stopped,
    QuickMode,
    Drift { expected: String, actual: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraversalOutcome {
    Completed { processed: Vec<u64> },
    Aborted { reason: AbortReason, processed: Vec<u64> },
}

pub trait TraversalHost {
    /// Why the walk must stop right now, if it must.
    fn abort_reason(&self) -> Option<AbortReason>;
    /// Cancellable sleep. False when the run was stopped meanwhile.
    fn pause(&mut self, ms: u64) -> bool;
    fn persist_last_key(&mut self, key: Option<u64>);
    fn read_delay_ms(&mut self) -> u64;
    /// Bernoulli trial for the cosmetic pointer movement.
    fn roll_pointer(&mut self) -> bool;
    fn log(&mut self, text: &str);

    fn settle_ms(&self) -> u64 {
        SETTLE_MS
    }

    fn grace_ms(&self) -> u64 {
        LOAD_GRACE_MS
    }
}

struct Walk<'p, 'h> {
    page: &'p mut dyn Page,
    host: &'h mut dyn TraversalHost,
    tracked: ItemLocation,
}

impl Walk<'_, '_> {
    fn checkpoint(&mut self) -> Result<(), AbortReason> {
        if let Some(reason) = self.host.abort_reason() {
            return Err(reason);
        }
        let current = self.page.location();
        match check_location(&self.tracked, &current) {
            LocationCheck::Same => Ok(()),
            LocationCheck::SameItem(updated) => {
                self.tracked = updated;
                Ok(())
            }
            LocationCheck::Changed => Err(AbortReason::Drift {
                expected: self.tracked.item_path.clone(),
                actual: current,
            }),
        }
    }

    fn pause(&mut self, ms: u64) -> Result<(), AbortReason> {
        if !self.host.pause(ms) {
            return Err(self.host.abort_reason().unwrap_or(AbortReason::Stopped));
        }
        self.checkpoint()
    }

    fn read(&mut self, item: &SubItem, unread: &dyn UnreadPredicate) -> Result<(), AbortReason> {
        if !self.page.is_in_view(item) {
            self.page.scroll_into_view(item);
        }
        let settle = self.host.settle_ms();
        self.pause(settle)?;

        if unread.is_unread(item, self.page.last_read_key()) {
            let delay = self.host.read_delay_ms();
            self.host
                .log(&format!("Reading sub-item {} ({} ms)", item.key, delay));
            self.pause(delay)?;
            if self.host.roll_pointer() {
                self.page.pointer_wiggle();
            }
        }
        Ok(())
    }
}

fn sorted_items(page: &dyn Page) -> Vec<SubItem> {
    let mut items = page.sub_items();
    items.sort_by_key(|item| item.key);
    items.dedup_by_key(|item| item.key);
    items
}

pub fn run_traversal(
    page: &mut dyn Page,
    unread: &dyn UnreadPredicate,
    host: &mut dyn TraversalHost,
    expected: &ItemLocation,
    last_key: Option<u64>,
) -> TraversalOutcome {
    let mut walk = Walk {
        page,
        host,
        tracked: expected.clone(),
    };
    let mut last = last_key;
    let mut processed = Vec::new();
    let mut idle_rounds = 0;

    macro_rules! bail {
        ($result:expr) => {
            if let Err(reason) = $result {
                return TraversalOutcome::Aborted { reason, processed };
            }
        };
    }

    loop {
        bail!(walk.checkpoint());

        let items = sorted_items(&*walk.page);
        let known_len = items.len();
        let known_max = items.last().map(|item| item.key);
        let start = items
            .iter()
            .position(|item| last.map_or(true, |key| item.key > key));

        if let Some(start) = start {
            walk.host.log(&format!(
                "Resuming at sub-item {} of {}",
                items[start].key, known_len
            ));
            for item in &items[start..] {
                bail!(walk.checkpoint());
                if last.is_some_and(|key| item.key <= key) {
                    continue;
                }
                bail!(walk.read(item, unread));
                last = Some(item.key);
                walk.host.persist_last_key(last);
                processed.push(item.key);
            }
        }

        let position_before = walk.page.scroll_position();
        walk.page.scroll_to_end();
        let grace = walk.host.grace_ms();
        bail!(walk.pause(grace));

        let after = sorted_items(&*walk.page);
        let grew = after.len() > known_len || after.last().map(|item| item.key) > known_max;
        let advanced = walk.page.scroll_position() > position_before;
        if grew || advanced {
            idle_rounds = 0;
        } else {
            idle_rounds += 1;
            walk.host.log(&format!(
                "No new sub-items ({}/{})",
                idle_rounds, IDLE_ROUND_LIMIT
            ));
            if idle_rounds >= IDLE_ROUND_LIMIT {
                break;
            }
        }
    }

    walk.host.persist_last_key(None);
    walk.host.log("All sub-items read");
    TraversalOutcome::Completed { processed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::{classify, PageKind};

    struct ScriptedPage {
        location: String,
        items: Vec<SubItem>,
        growth: Vec<Vec<u64>>,
        position: i64,
        navigate_after_scrolls: Option<(usize, String)>,
        scrolls: usize,
    }

    impl ScriptedPage {
        fn with_keys(keys: &[u64]) -> Self {
            Self {
                location: "/t/topic/42".to_string(),
                items: keys.iter().map(|key| SubItem::new(*key)).collect(),
                growth: Vec::new(),
                position: 0,
                navigate_after_scrolls: None,
                scrolls: 0,
            }
        }
    }

    impl Page for ScriptedPage {
        fn location(&self) -> String {
            self.location.clone()
        }
        fn item_links(&self) -> Vec<String> {
            Vec::new()
        }
        fn sub_items(&self) -> Vec<SubItem> {
            self.items.clone()
        }
        fn is_in_view(&self, _item: &SubItem) -> bool {
            false
        }
        fn scroll_into_view(&mut self, item: &SubItem) {
            self.scrolls += 1;
            self.position = self.position.max(item.key as i64);
            if let Some((after, target)) = &self.navigate_after_scrolls {
                if self.scrolls >= *after {
                    self.location = target.clone();
                }
            }
        }
        fn scroll_to_end(&mut self) {
            if !self.growth.is_empty() {
                let batch = self.growth.remove(0);
                self.items.extend(batch.into_iter().map(SubItem::new));
            }
            self.position = self.position.max(self.items.len() as i64 * 1_000);
        }
        fn scroll_position(&self) -> i64 {
            self.position
        }
        fn pointer_wiggle(&mut self) {}
        fn navigate(&mut self, url: &str) {
            self.location = url.to_string();
        }
        fn reload(&mut self) {}
    }

    #[derive(Default)]
    struct RecordingHost {
        persisted: Vec<Option<u64>>,
        abort: Option<AbortReason>,
        pauses: u32,
        abort_after_pauses: Option<u32>,
    }

    impl TraversalHost for RecordingHost {
        fn abort_reason(&self) -> Option<AbortReason> {
            self.abort.clone()
        }
        fn pause(&mut self, _ms: u64) -> bool {
            self.pauses += 1;
            if self.abort_after_pauses == Some(self.pauses) {
                self.abort = Some(AbortReason::Stopped);
            }
            self.abort.is_none()
        }
        fn persist_last_key(&mut self, key: Option<u64>) {
            self.persisted.push(key);
        }
        fn read_delay_ms(&mut self) -> u64 {
            1
        }
        fn roll_pointer(&mut self) -> bool {
            false
        }
        fn log(&mut self, _text: &str) {}
    }

    struct AlwaysUnread;
    impl UnreadPredicate for AlwaysUnread {
        fn is_unread(&self, _item: &SubItem, _last: Option<u64>) -> bool {
            true
        }
    }

    fn expected() -> ItemLocation {
        match classify("/t/topic/42") {
            PageKind::Item(location) => location,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn resumes_strictly_after_last_key() {
        let mut page = ScriptedPage::with_keys(&[118, 119, 120, 121, 122]);
        let mut host = RecordingHost::default();
        let outcome = run_traversal(&mut page, &AlwaysUnread, &mut host, &expected(), Some(120));

        assert_eq!(
            outcome,
            TraversalOutcome::Completed {
                processed: vec![121, 122]
            }
        );
        assert_eq!(host.persisted, vec![Some(121), Some(122), None]);
    }

    #[test]
    fn fixed_sequence_processed_once_in_order() {
        let mut page = ScriptedPage::with_keys(&[5, 1, 3, 2, 4]);
        let mut host = RecordingHost::default();
        let outcome = run_traversal(&mut page, &AlwaysUnread, &mut host, &expected(), None);
        assert_eq!(
            outcome,
            TraversalOutcome::Completed {
                processed: vec![1, 2, 3, 4, 5]
            }
        );
    }

    #[test]
    fn picks_up_items_loaded_by_scrolling() {
        let mut page = ScriptedPage::with_keys(&[1, 2]);
        page.growth = vec![vec![3, 4], vec![5]];
        let mut host = RecordingHost::default();
        let outcome = run_traversal(&mut page, &AlwaysUnread, &mut host, &expected(), None);
        assert_eq!(
            outcome,
            TraversalOutcome::Completed {
                processed: vec![1, 2, 3, 4, 5]
            }
        );
    }

    #[test]
    fn stop_aborts_and_keeps_progress() {
        let mut page = ScriptedPage::with_keys(&[1, 2, 3]);
        let mut host = RecordingHost {
            abort_after_pauses: Some(3),
            ..RecordingHost::default()
        };
        let outcome = run_traversal(&mut page, &AlwaysUnread, &mut host, &expected(), None);
        assert_eq!(
            outcome,
            TraversalOutcome::Aborted {
                reason: AbortReason::Stopped,
                processed: vec![1]
            }
        );
        assert_eq!(host.persisted, vec![Some(1)]);
    }

    #[test]
    fn suffix_change_is_tolerated() {
        let mut page = ScriptedPage::with_keys(&[1, 2]);
        page.navigate_after_scrolls = Some((1, "/t/topic/42/2".to_string()));
        let mut host = RecordingHost::default();
        let outcome = run_traversal(&mut page, &AlwaysUnread, &mut host, &expected(), None);
        assert!(matches!(outcome, TraversalOutcome::Completed { .. }));
    }

    #[test]
    fn different_item_aborts_with_drift() {
        let mut page = ScriptedPage::with_keys(&[1, 2, 3]);
        page.navigate_after_scrolls = Some((2, "/t/topic/77".to_string()));
        let mut host = RecordingHost::default();
        let outcome = run_traversal(&mut page, &AlwaysUnread, &mut host, &expected(), None);
        match outcome {
            TraversalOutcome::Aborted {
                reason: AbortReason::Drift { expected, actual },
                processed,
            } => {
                assert_eq!(expected, "/t/topic/42");
                assert_eq!(actual, "/t/topic/77");
                assert_eq!(processed, vec![1]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!host.persisted.contains(&None));
    }
}
