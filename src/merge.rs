use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::model::{FeedItem, Post};

/// Flattens both streams into one list, newest first.
///
/// The sort is stable over predictions-then-daily concatenation, so equal
/// timestamps keep predictions ahead. Items without a parseable timestamp
/// sink to the bottom. A key seen twice (page boundaries shift when new
/// posts arrive between fetches) keeps its first occurrence.
pub fn merge(prediction_pages: &[Vec<Post>], daily_pages: &[Vec<Post>]) -> Vec<FeedItem> {
    let predictions = prediction_pages
        .iter()
        .flatten()
        .cloned()
        .map(FeedItem::Prediction);
    let daily = daily_pages.iter().flatten().cloned().map(FeedItem::Daily);

    let mut seen = HashSet::new();
    let mut items: Vec<(DateTime<Utc>, FeedItem)> = predictions
        .chain(daily)
        .filter(|item| seen.insert(item.key()))
        .map(|item| (item.created_at().unwrap_or(DateTime::<Utc>::MIN_UTC), item))
        .collect();

    items.sort_by(|a, b| b.0.cmp(&a.0));
    items.into_iter().map(|(_, item)| item).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeedKey, FeedKind};

    fn post(id: u64, created_at: &str) -> Post {
        Post {
            id,
            created_at: created_at.to_string(),
            ..Post::default()
        }
    }

    fn keys(items: &[FeedItem]) -> Vec<String> {
        items.iter().map(|item| item.key().to_string()).collect()
    }

    #[test]
    fn orders_newest_first_across_streams() {
        let predictions = vec![
            vec![post(1, "2024-05-03T10:00:00Z"), post(2, "2024-05-01T10:00:00Z")],
            vec![post(3, "2024-04-20T10:00:00Z")],
        ];
        let daily = vec![vec![
            post(1, "2024-05-02T10:00:00Z"),
            post(2, "2024-05-04T08:00:00+02:00"),
        ]];

        let merged = merge(&predictions, &daily);
        assert_eq!(
            keys(&merged),
            vec!["daily:2", "prediction:1", "daily:1", "prediction:2", "prediction:3"]
        );
        let stamps: Vec<_> = merged.iter().map(|item| item.created_at().unwrap()).collect();
        assert!(stamps.windows(2).all(|pair| pair[0] >= pair[1]));
    }

    #[test]
    fn ties_keep_predictions_first() {
        let stamp = "2024-05-01T12:00:00Z";
        let merged = merge(
            &[vec![post(7, stamp), post(8, stamp)]],
            &[vec![post(7, stamp)]],
        );
        assert_eq!(keys(&merged), vec!["prediction:7", "prediction:8", "daily:7"]);
    }

    #[test]
    fn unparseable_timestamps_sort_last() {
        let merged = merge(
            &[vec![post(1, "not a date"), post(2, "2020-01-01T00:00:00Z")]],
            &[vec![post(3, ""), post(4, "1999-12-31T23:59:59Z")]],
        );
        assert_eq!(
            keys(&merged),
            vec!["prediction:2", "daily:4", "prediction:1", "daily:3"]
        );
    }

    #[test]
    fn same_id_in_both_kinds_is_kept_twice() {
        let merged = merge(
            &[vec![post(5, "2024-01-01T00:00:00Z")]],
            &[vec![post(5, "2024-01-01T00:00:00Z")]],
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].key(), FeedKey::new(FeedKind::Prediction, 5));
        assert_eq!(merged[1].key(), FeedKey::new(FeedKind::Daily, 5));
    }

    #[test]
    fn duplicate_keys_keep_first_occurrence() {
        let mut shifted = post(9, "2024-01-01T00:00:00Z");
        shifted.title = "stale copy".into();
        let mut first = post(9, "2024-01-01T00:00:00Z");
        first.title = "head copy".into();
        let merged = merge(&[vec![first], vec![shifted]], &[]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].post().title, "head copy");
    }

    #[test]
    fn empty_inputs() {
        assert!(merge(&[], &[]).is_empty());
        assert!(merge(&[vec![]], &[vec![], vec![]]).is_empty());
    }
}
