//! Paged history retrieval with an exclusive upper-bound message id.

use serde_json::Value;

use crate::client::MessengerClient;
use crate::error::{ConfigError, RetrievalError};
use crate::output::Emitter;
use crate::pipeline::{Pipeline, Verdict};

pub const DEFAULT_LIMIT: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageCursor {
    /// Only messages strictly older than this id; `None` starts at the newest.
    pub before_id: Option<i64>,
    pub limit: usize,
}

impl PageCursor {
    pub fn new(before_id: Option<i64>, limit: usize) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::InvalidLimit);
        }
        Ok(Self { before_id, limit })
    }
}

/// Which way a history read walks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HistoryDirection {
    /// Newest to oldest.
    #[default]
    Backward,
    /// Oldest to newest.
    Forward,
}

impl HistoryDirection {
    /// True when `id` lies past `bound` in reading order.
    fn beyond(self, id: i64, bound: i64) -> bool {
        match self {
            HistoryDirection::Backward => id < bound,
            HistoryDirection::Forward => id > bound,
        }
    }
}

/// Exclusive id bounds of one history read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HistoryRange {
    pub direction: HistoryDirection,
    /// Reading starts past this id.
    pub from_id: Option<i64>,
    /// Reading stops before this id.
    pub to_id: Option<i64>,
}

impl HistoryRange {
    pub fn backward(before_id: Option<i64>) -> Self {
        Self {
            from_id: before_id,
            ..Self::default()
        }
    }

    /// Builds a range from command line bounds. When both ends are given
    /// their order decides the direction; `inclusive` widens both ends by one.
    pub fn resolve(
        from_id: Option<i64>,
        to_id: Option<i64>,
        requested: Option<HistoryDirection>,
        inclusive: bool,
    ) -> Self {
        let direction = match (from_id, to_id) {
            (Some(from), Some(to)) if from != to => {
                let inferred = if to > from {
                    HistoryDirection::Forward
                } else {
                    HistoryDirection::Backward
                };
                if requested.is_some_and(|requested| requested != inferred) {
                    tracing::warn!(?inferred, "direction follows the order of --from-id and --to-id");
                }
                inferred
            }
            _ => requested.unwrap_or_default(),
        };

        let (from_id, to_id) = match (inclusive, direction) {
            (false, _) => (from_id, to_id),
            (true, HistoryDirection::Backward) => (
                from_id.map(|id| id.saturating_add(1)),
                to_id.map(|id| id.saturating_sub(1).max(0)),
            ),
            (true, HistoryDirection::Forward) => (
                from_id.map(|id| id.saturating_sub(1).max(0)),
                to_id.map(|id| id.saturating_add(1)),
            ),
        };
        Self {
            direction,
            from_id,
            to_id,
        }
    }
}

#[derive(Debug, Default)]
pub struct Page {
    pub records: Vec<Value>,
    pub next_cursor: Option<PageCursor>,
    pub fetched: usize,
    pub rejected: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HistorySummary {
    pub fetched: usize,
    pub emitted: usize,
    pub rejected: usize,
    /// Last id reached: the oldest for backward reads, the newest for forward ones.
    pub next_from_id: Option<i64>,
}

/// One page read in either direction.
struct RangePage {
    page: Page,
    /// Furthest id kept, in reading order.
    edge: Option<i64>,
    reached_end: bool,
}

pub struct Paginator {
    pipeline: Pipeline,
    batch_ceiling: usize,
}

impl Paginator {
    pub fn new(pipeline: Pipeline, batch_ceiling: usize) -> Self {
        Self {
            pipeline,
            batch_ceiling: batch_ceiling.max(1),
        }
    }

    pub async fn fetch_page<C: MessengerClient + ?Sized>(
        &self,
        client: &mut C,
        chat: i64,
        cursor: PageCursor,
    ) -> Result<Page, RetrievalError> {
        let range = HistoryRange::backward(cursor.before_id);
        let RangePage {
            mut page,
            edge,
            reached_end,
        } = self.read_page(client, chat, range, cursor.limit).await?;
        if !reached_end {
            page.next_cursor = edge.map(|before_id| PageCursor {
                before_id: Some(before_id),
                limit: cursor.limit,
            });
        }
        Ok(page)
    }

    async fn read_page<C: MessengerClient + ?Sized>(
        &self,
        client: &mut C,
        chat: i64,
        range: HistoryRange,
        limit: usize,
    ) -> Result<RangePage, RetrievalError> {
        let direction = range.direction;
        let count = limit.min(self.batch_ceiling);
        tracing::debug!(chat, ?direction, from_id = ?range.from_id, count, "fetching history page");
        let raw = match direction {
            HistoryDirection::Backward => client.fetch_history(chat, range.from_id, count).await,
            HistoryDirection::Forward => client.fetch_history_after(chat, range.from_id, count).await,
        }
        .map_err(RetrievalError::History)?;

        if raw.is_empty() {
            tracing::debug!(chat, "history exhausted");
            return Ok(RangePage {
                page: Page::default(),
                edge: None,
                reached_end: true,
            });
        }

        let delivered = raw.len();
        let in_bounds: Vec<_> = raw
            .into_iter()
            .filter(|record| match (range.from_id, record.message_id()) {
                (Some(bound), Some(id)) => direction.beyond(id, bound),
                _ => true,
            })
            .take(count)
            .collect();
        if in_bounds.len() < delivered {
            tracing::warn!(
                chat,
                delivered,
                kept = in_bounds.len(),
                "client returned messages outside the requested page"
            );
        }

        let mut reached_end = false;
        let mut edge = None;
        let mut page = Page::default();
        for record in &in_bounds {
            let id = record.message_id();
            if let (Some(stop), Some(id)) = (range.to_id, id) {
                if !direction.beyond(stop, id) {
                    reached_end = true;
                    continue;
                }
            }
            if let Some(id) = id {
                edge = Some(match edge {
                    Some(current) if direction.beyond(current, id) => current,
                    _ => id,
                });
            }
            page.fetched += 1;
            match self.pipeline.process(record) {
                Verdict::Emit(value) => page.records.push(value),
                Verdict::Rejected => page.rejected += 1,
            }
        }

        if edge.is_none() && !reached_end {
            tracing::warn!(chat, "page carried no message ids, stopping");
            reached_end = true;
        }
        Ok(RangePage {
            page,
            edge,
            reached_end,
        })
    }

    /// Fetches pages until `limit` messages were read (`None` reads the whole
    /// range), emitting accepted records as each page arrives.
    pub async fn run<C: MessengerClient + ?Sized>(
        &self,
        client: &mut C,
        chat: i64,
        range: HistoryRange,
        limit: Option<usize>,
        emitter: &mut Emitter,
    ) -> Result<HistorySummary, RetrievalError> {
        let mut summary = HistorySummary::default();
        let mut range = Some(range);
        let mut wanted = limit.unwrap_or(self.batch_ceiling).max(1);

        while let Some(current) = range {
            let RangePage {
                page,
                edge,
                reached_end,
            } = self.read_page(client, chat, current, wanted).await?;
            summary.fetched += page.fetched;
            summary.rejected += page.rejected;
            for record in &page.records {
                emitter.emit(record).await?;
                summary.emitted += 1;
            }
            if edge.is_some() {
                summary.next_from_id = edge;
            }

            range = match (reached_end, limit) {
                (true, _) => None,
                (false, Some(limit)) => {
                    wanted = limit.saturating_sub(summary.fetched);
                    (wanted > 0).then_some(HistoryRange {
                        from_id: edge,
                        ..current
                    })
                }
                (false, None) => Some(HistoryRange {
                    from_id: edge,
                    ..current
                }),
            };
        }

        tracing::info!(
            chat,
            fetched = summary.fetched,
            emitted = summary.emitted,
            rejected = summary.rejected,
            "history done"
        );
        Ok(summary)
    }
}
