use super::{Stream, StreamId, StreamTable};
use crate::config::StreamLimits;
use crate::error::StageErrno;
use crate::request::{RequestStore, StageRequest};
use crate::sync::lock_unpoisoned;
use crate::telemetry::tags;
use crate::types::{MediaType, RequestFlags, RequestId, Vsn};

/// Outcome of one composition pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Composition {
    /// Streams created, in work-queue order.
    pub streams: Vec<StreamId>,
    /// Requests short-circuited as duplicates; already flagged and given an error.
    pub duplicates: Vec<RequestId>,
    /// Requests canceled before they reached a stream.
    pub canceled: Vec<RequestId>,
}

/// Groups pending requests into position-sorted streams per volume.
#[derive(Debug)]
pub struct StreamComposer {
    limits: StreamLimits,
    pending: Vec<RequestId>,
}

impl StreamComposer {
    pub fn new(limits: StreamLimits) -> Self {
        Self {
            limits,
            pending: Vec::new(),
        }
    }

    pub fn limits(&self) -> StreamLimits {
        self.limits
    }

    pub fn push(&mut self, index: RequestId) {
        if !self.pending.contains(&index) {
            self.pending.push(index);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Composes every queued request.
    pub fn compose_pending(&mut self, store: &RequestStore, table: &StreamTable) -> Composition {
        let pending = std::mem::take(&mut self.pending);
        self.compose(&pending, store, table)
    }

    /// Sorts `pending` by volume and placement and cuts it into new streams.
    ///
    /// A new stream starts when the volume changes, when a cleanup request is seen,
    /// when the open stream already holds a retained cache descriptor, and when the open
    /// stream is full.
    pub fn compose(&self, pending: &[RequestId], store: &RequestStore, table: &StreamTable) -> Composition {
        let mut outcome = Composition::default();
        let mut keyed: Vec<(SortKey, RequestId)> = pending
            .iter()
            .filter_map(|index| store.with(*index, |request| (sort_key(request), *index)))
            .collect();
        keyed.sort();

        let mut open: Option<Stream> = None;
        for (_, index) in keyed {
            let Some(request) = store.get(index) else {
                continue;
            };
            if request.flags.contains(RequestFlags::CANCEL) && !request.is_cleanup() {
                store.update(index, |request| request.error = Some(StageErrno::Canceled));
                outcome.canceled.push(index);
                continue;
            }

            let reuse = open.as_ref().is_some_and(|stream| {
                if request.is_cleanup() {
                    stream.is_cleanup() && stream.context == request.context && stream.vsn == *request.vsn()
                } else {
                    stream.accepts(store, &request)
                }
            });
            if !reuse {
                if let Some(done) = open.take() {
                    outcome.streams.push(table.insert(done));
                }
                open = Some(Stream::for_request(table.next_id(), &request, self.limits));
            }

            let Some(stream) = open.as_mut() else {
                continue;
            };
            if !request.is_cleanup() {
                if let Some(existing) = stream.find_duplicate(store, &request) {
                    let loser = resolve_duplicate(store, existing, index);
                    if loser == existing {
                        stream.remove(store, existing);
                    }
                    outcome.duplicates.push(loser);
                    if loser == index {
                        continue;
                    }
                }
            }
            stream.append(store, index);
        }
        if let Some(done) = open.take() {
            outcome.streams.push(table.insert(done));
        }

        for id in &outcome.streams {
            if let Some(stream) = table.get(*id) {
                let stream = lock_unpoisoned(&stream);
                tracing::debug!(
                    target: tags::TARGET_SCHEDULER,
                    stream = stream.id,
                    vsn = %stream.vsn,
                    media = %stream.media,
                    count = stream.count,
                    size = stream.size,
                    cleanup = stream.is_cleanup(),
                    "stream composed"
                );
            }
        }
        outcome
    }
}

type SortKey = (Vsn, MediaType, bool, u64, u64, u64);

fn sort_key(request: &StageRequest) -> SortKey {
    let section = request.section();
    (
        request.vsn().clone(),
        request.media(),
        request.is_cleanup(),
        section.position,
        section.offset,
        request.arrival,
    )
}

/// Applies the duplicate law to two requests for the same data and returns the one
/// flagged duplicate: never an active request, otherwise the later arrival.
pub(crate) fn resolve_duplicate(store: &RequestStore, existing: RequestId, incoming: RequestId) -> RequestId {
    let existing_active = store.with(existing, StageRequest::is_active).unwrap_or(false);
    let incoming_active = store.with(incoming, StageRequest::is_active).unwrap_or(false);
    let loser = if incoming_active && !existing_active {
        existing
    } else {
        incoming
    };
    store.update(loser, |request| {
        request.flags.insert(RequestFlags::DUPLICATE);
        request.error = Some(StageErrno::AlreadyExists);
    });
    tracing::info!(
        target: tags::TARGET_SCHEDULER,
        slot = loser,
        kept = if loser == existing { incoming } else { existing },
        "duplicate request short-circuited"
    );
    loser
}
