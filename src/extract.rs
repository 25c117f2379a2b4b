//! Stargazer extraction for a single repository
//!
//! Walks the paginated stargazer connection as a lazy stream of pages and
//! stops early once the watermark is reached in descending order.

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use tracing::debug;

use crate::github::{Direction, FetchError, GitHubClient, RepoSlug, StargazerEvent};

/// Why extraction of a repository ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The API reported no further pages
    Exhausted,
    /// An event at or before the watermark was observed
    Watermark,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Exhausted => "exhausted",
            StopReason::Watermark => "watermark",
        }
    }
}

/// One page of extracted events, already filtered against the watermark
#[derive(Debug)]
pub struct ExtractedPage {
    pub events: Vec<StargazerEvent>,
    /// Set on the final page
    pub stop: Option<StopReason>,
}

/// Everything extracted for one repository
#[derive(Debug)]
pub struct RepoExtract {
    pub repo: RepoSlug,
    pub events: Vec<StargazerEvent>,
    pub pages: usize,
    pub stop: StopReason,
}

impl RepoExtract {
    /// Latest star time among the extracted events
    pub fn max_starred_at(&self) -> Option<DateTime<Utc>> {
        self.events.iter().map(|e| e.starred_at).max()
    }
}

enum Cursor {
    Start,
    After(String),
    Done,
}

/// Drop events at or before the watermark.
///
/// Returns the kept events and whether the boundary was crossed. In descending
/// order everything after the first old event is older still, so the page is
/// cut there; ascending pages are filtered but never end the walk.
fn apply_watermark(
    mut events: Vec<StargazerEvent>,
    direction: Direction,
    watermark: Option<DateTime<Utc>>,
) -> (Vec<StargazerEvent>, bool) {
    let Some(mark) = watermark else {
        return (events, false);
    };

    match direction {
        Direction::Desc => match events.iter().position(|e| e.starred_at <= mark) {
            Some(idx) => {
                events.truncate(idx);
                (events, true)
            }
            None => (events, false),
        },
        Direction::Asc => {
            events.retain(|e| e.starred_at > mark);
            (events, false)
        }
    }
}

/// Lazy, finite stream of stargazer pages for one repository.
///
/// Pages are fetched one at a time, each request carrying the previous
/// page's end cursor. Nothing is requested until the stream is polled.
pub fn stargazer_pages<'a>(
    client: &'a GitHubClient,
    repo: &'a RepoSlug,
    direction: Direction,
    watermark: Option<DateTime<Utc>>,
    page_size: usize,
) -> impl Stream<Item = Result<ExtractedPage, FetchError>> + 'a {
    stream::try_unfold(Cursor::Start, move |cursor| async move {
        let after = match cursor {
            Cursor::Done => return Ok(None),
            Cursor::Start => None,
            Cursor::After(c) => Some(c),
        };

        let page = client
            .fetch_stargazer_page(repo, direction, after.as_deref(), page_size)
            .await?;

        let (events, hit_watermark) = apply_watermark(page.events, direction, watermark);

        let (next, stop) = if hit_watermark {
            (Cursor::Done, Some(StopReason::Watermark))
        } else {
            match (page.has_next_page, page.end_cursor) {
                (true, Some(c)) => (Cursor::After(c), None),
                _ => (Cursor::Done, Some(StopReason::Exhausted)),
            }
        };

        Ok(Some((ExtractedPage { events, stop }, next)))
    })
}

/// Drain [`stargazer_pages`] into a [`RepoExtract`]
pub async fn extract_repo(
    client: &GitHubClient,
    repo: &RepoSlug,
    direction: Direction,
    watermark: Option<DateTime<Utc>>,
    page_size: usize,
) -> Result<RepoExtract, FetchError> {
    let mut pages = std::pin::pin!(stargazer_pages(client, repo, direction, watermark, page_size));

    let mut extract = RepoExtract {
        repo: repo.clone(),
        events: Vec::new(),
        pages: 0,
        stop: StopReason::Exhausted,
    };

    while let Some(page) = pages.try_next().await? {
        extract.pages += 1;
        extract.events.extend(page.events);
        if let Some(stop) = page.stop {
            extract.stop = stop;
        }
    }

    debug!(
        target: "stargaze::extract",
        repo = %repo,
        pages = extract.pages,
        events = extract.events.len(),
        stop = extract.stop.as_str(),
        "repository extracted"
    );

    Ok(extract)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_client, ts, FakeGitHub};
    use std::collections::HashSet;

    fn slug(s: &str) -> RepoSlug {
        RepoSlug::parse(s).unwrap()
    }

    fn event(user_id: i64, at: &str) -> StargazerEvent {
        StargazerEvent {
            repo_full_name: "octo/demo".to_string(),
            user_id,
            login: format!("user{}", user_id),
            starred_at: ts(at),
        }
    }

    #[test]
    fn test_apply_watermark_descending_cuts_page() {
        let events = vec![
            event(3, "2024-03-01T00:00:00Z"),
            event(2, "2024-02-01T00:00:00Z"),
            event(1, "2024-01-01T00:00:00Z"),
        ];
        let (kept, hit) = apply_watermark(events, Direction::Desc, Some(ts("2024-02-01T00:00:00Z")));
        assert!(hit);
        assert_eq!(kept.iter().map(|e| e.user_id).collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_apply_watermark_ascending_filters_only() {
        let events = vec![
            event(1, "2024-01-01T00:00:00Z"),
            event(2, "2024-02-01T00:00:00Z"),
            event(3, "2024-03-01T00:00:00Z"),
        ];
        let (kept, hit) = apply_watermark(events, Direction::Asc, Some(ts("2024-01-15T00:00:00Z")));
        assert!(!hit);
        assert_eq!(kept.iter().map(|e| e.user_id).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_apply_watermark_none_keeps_everything() {
        let events = vec![event(1, "2024-01-01T00:00:00Z")];
        let (kept, hit) = apply_watermark(events, Direction::Desc, None);
        assert!(!hit);
        assert_eq!(kept.len(), 1);
    }

    #[tokio::test]
    async fn test_pagination_exhaustion() {
        let fake = FakeGitHub::start().await;
        fake.add_generated_stars("octo/demo", 250);

        let client = test_client(&fake.uri());
        let extract = extract_repo(&client, &slug("octo/demo"), Direction::Asc, None, 100)
            .await
            .unwrap();

        // ceil(250 / 100) page requests, every event exactly once
        assert_eq!(fake.requests("octo/demo").len(), 3);
        assert_eq!(extract.pages, 3);
        assert_eq!(extract.events.len(), 250);
        let ids: HashSet<i64> = extract.events.iter().map(|e| e.user_id).collect();
        assert_eq!(ids.len(), 250);
        assert_eq!(extract.stop, StopReason::Exhausted);

        // Ascending order is preserved across pages
        assert!(extract.events.windows(2).all(|w| w[0].starred_at <= w[1].starred_at));
    }

    #[tokio::test]
    async fn test_exact_multiple_of_page_size() {
        let fake = FakeGitHub::start().await;
        fake.add_generated_stars("octo/demo", 200);

        let client = test_client(&fake.uri());
        let extract = extract_repo(&client, &slug("octo/demo"), Direction::Desc, None, 100)
            .await
            .unwrap();

        assert_eq!(fake.requests("octo/demo").len(), 2);
        assert_eq!(extract.events.len(), 200);
        assert!(extract.events.windows(2).all(|w| w[0].starred_at >= w[1].starred_at));
    }

    #[tokio::test]
    async fn test_empty_repository() {
        let fake = FakeGitHub::start().await;
        fake.add_stars("octo/empty", &[]);

        let client = test_client(&fake.uri());
        let extract = extract_repo(&client, &slug("octo/empty"), Direction::Desc, None, 100)
            .await
            .unwrap();

        assert_eq!(extract.pages, 1);
        assert!(extract.events.is_empty());
        assert_eq!(extract.max_starred_at(), None);
    }

    #[tokio::test]
    async fn test_descending_stops_at_watermark() {
        let fake = FakeGitHub::start().await;
        fake.add_generated_stars("octo/demo", 250);

        // Generated stars are one hour apart starting at the base time;
        // a watermark at star #240 leaves the newest 10
        let watermark = fake.generated_time(239);

        let client = test_client(&fake.uri());
        let extract = extract_repo(&client, &slug("octo/demo"), Direction::Desc, Some(watermark), 100)
            .await
            .unwrap();

        assert_eq!(extract.stop, StopReason::Watermark);
        assert_eq!(extract.events.len(), 10);
        assert!(extract.events.iter().all(|e| e.starred_at > watermark));
        // Only the first page was needed
        assert_eq!(fake.requests("octo/demo").len(), 1);
    }

    #[tokio::test]
    async fn test_stream_is_lazy() {
        let fake = FakeGitHub::start().await;
        fake.add_generated_stars("octo/demo", 250);

        let client = test_client(&fake.uri());
        let repo = slug("octo/demo");
        let mut pages = std::pin::pin!(stargazer_pages(&client, &repo, Direction::Asc, None, 100));
        assert!(fake.requests("octo/demo").is_empty());

        let first = pages.try_next().await.unwrap().unwrap();
        assert_eq!(first.events.len(), 100);
        assert_eq!(first.stop, None);
        assert_eq!(fake.requests("octo/demo").len(), 1);
    }
}
