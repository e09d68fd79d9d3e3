//! Keyed collection windows.
//!
//! The first item for a key opens a window; items for the same key accumulate
//! until the owner flushes it, after which the next item opens a fresh one.
//! The window does not keep time itself: the owner arms exactly one timer when
//! [`CollectionWindow::offer`] reports [`WindowUpdate::Opened`].

use std::collections::HashMap;
use std::time::Duration;

use ema_protocol::{Event, EventKey};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_PER_WINDOW: usize = 1;

/// Numeric rank used when a window is flushed.
pub trait Scored {
    fn score(&self) -> f64;
}

impl Scored for Event {
    /// `offerScore`, read as a number or a numeric string. Anything else
    /// ranks as 0.
    fn score(&self) -> f64 {
        match self.get(EventKey::OFFER_SCORE) {
            Some(value) => value
                .as_f64()
                .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
                .unwrap_or(0.0),
            None => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowUpdate {
    /// First item for the key: arm the timer.
    Opened,
    /// Added to an open window; `pending` items are now held.
    Appended { pending: usize },
}

#[derive(Debug)]
pub struct CollectionWindow<T> {
    pending: HashMap<String, Vec<T>>,
    delay: Duration,
    max_per_window: usize,
}

impl<T: Scored> Default for CollectionWindow<T> {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_MAX_PER_WINDOW)
    }
}

impl<T: Scored> CollectionWindow<T> {
    pub fn new(delay: Duration, max_per_window: usize) -> Self {
        Self {
            pending: HashMap::new(),
            delay,
            max_per_window,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_open(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Number of open windows.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn offer(&mut self, key: &str, item: T) -> WindowUpdate {
        match self.pending.get_mut(key) {
            Some(items) => {
                items.push(item);
                WindowUpdate::Appended {
                    pending: items.len(),
                }
            }
            None => {
                self.pending.insert(key.to_string(), vec![item]);
                WindowUpdate::Opened
            }
        }
    }

    /// Close the key's window and return its selection: the items in
    /// ascending score order (ties keep arrival order), truncated to the
    /// per-window maximum. `None` if no window is open for `key`.
    pub fn flush(&mut self, key: &str) -> Option<Vec<T>> {
        let mut items = self.pending.remove(key)?;
        items.sort_by(|a, b| a.score().total_cmp(&b.score()));
        items.truncate(self.max_per_window);
        Some(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ema_protocol::EventName;
    use serde_json::json;

    #[derive(Debug, PartialEq)]
    struct Offer(&'static str, f64);

    impl Scored for Offer {
        fn score(&self) -> f64 {
            self.1
        }
    }

    #[test]
    fn test_first_offer_opens_rest_append() {
        let mut window = CollectionWindow::new(DEFAULT_WINDOW, 1);
        assert_eq!(window.offer("s1", Offer("a", 1.0)), WindowUpdate::Opened);
        assert_eq!(
            window.offer("s1", Offer("b", 2.0)),
            WindowUpdate::Appended { pending: 2 }
        );
        assert_eq!(window.offer("s2", Offer("c", 3.0)), WindowUpdate::Opened);
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_flush_keeps_lowest_score_and_closes_window() {
        let mut window = CollectionWindow::new(DEFAULT_WINDOW, 1);
        window.offer("s2", Offer("twenty", 20.0));
        window.offer("s2", Offer("five", 5.0));

        assert_eq!(window.flush("s2"), Some(vec![Offer("five", 5.0)]));
        assert!(!window.is_open("s2"));
        assert_eq!(window.flush("s2"), None);

        // A later offer starts over.
        assert_eq!(window.offer("s2", Offer("late", 1.0)), WindowUpdate::Opened);
    }

    #[test]
    fn test_flush_is_stable_for_ties() {
        let mut window = CollectionWindow::new(DEFAULT_WINDOW, 3);
        window.offer("k", Offer("first", 2.0));
        window.offer("k", Offer("second", 2.0));
        window.offer("k", Offer("low", 1.0));
        window.offer("k", Offer("high", 9.0));

        let names: Vec<_> = window.flush("k").unwrap().iter().map(|o| o.0).collect();
        assert_eq!(names, vec!["low", "first", "second"]);
    }

    #[test]
    fn test_event_score_parsing() {
        let offer = |score: serde_json::Value| {
            Event::builder(EventName::OFFER)
                .field(EventKey::OFFER_SCORE, score)
                .build()
        };
        assert_eq!(offer(json!(20)).score(), 20.0);
        assert_eq!(offer(json!("7.5")).score(), 7.5);
        assert_eq!(offer(json!("high")).score(), 0.0);
        assert_eq!(Event::new(EventName::OFFER).score(), 0.0);
    }
}
