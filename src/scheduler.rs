//! Reduction scheduler.
//!
//! [ReductionScheduler] owns the tree and drives a reduction from a single logical thread. It
//! dispatches one row or group at a time to a background [ExecutionSlot], updates node state
//! when the work completes and keeps processed nodes consistent with the workspace store.
//!
//! The scheduler never blocks: [ReductionScheduler::process] starts a reduction and returns
//! after the first dispatch, and [ReductionScheduler::run] drives completions and store
//! notifications until nothing is in flight.

use crate::engine::{self, ReductionContext};
use crate::error::ReductionError;
use crate::executor::{Completion, ExecutionSlot};
use crate::metrics::{outcome, GROUPS_POSTPROCESSED, ROWS_PROCESSED};
use crate::row_data::{slice_suffix, NodeState, RowData, RowId};
use crate::tree_manager::{ProcessedOutput, Selection, TreeManager};
use crate::workspace_store::{StoreEvent, WorkspaceStore};

use hashbrown::HashSet;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, watch, OwnedSemaphorePermit};
use tracing::{debug, info, info_span, warn};

/// Re-processing policy of a [ReductionScheduler::process] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessRequest {
    /// Re-process nodes that are already processed
    pub force_all: bool,
    /// Re-process nodes that failed
    pub retry_failed: bool,
}

impl ProcessRequest {
    /// User initiated processing: failed nodes are retried.
    pub fn selected() -> Self {
        ProcessRequest {
            force_all: false,
            retry_failed: true,
        }
    }

    /// Background processing: only unprocessed nodes are reduced.
    pub fn background() -> Self {
        Self::default()
    }

    /// Everything in the selection is reduced again.
    pub fn forced() -> Self {
        ProcessRequest {
            force_all: true,
            retry_failed: true,
        }
    }

    fn needs(&self, state: NodeState) -> bool {
        match state {
            NodeState::Unprocessed | NodeState::Processing => true,
            NodeState::Processed => self.force_all,
            NodeState::Failed => self.force_all || self.retry_failed,
        }
    }
}

/// Progress of the current reduction, in units of rows and post-processed groups.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub done: usize,
    pub total: usize,
}

/// Identity of a dispatched unit of work, returned unchanged on completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkItem {
    Row { id: RowId },
    Group { index: usize },
}

/// Result of a unit of work.
#[derive(Debug)]
pub enum WorkOutput {
    /// The reduced copy of the row
    Row(RowData),
    /// Name of the post-processed output
    Group(String),
}

type WorkCompletion = Completion<WorkItem, WorkOutput>;

/// The unit of work currently occupying the execution slot.
#[derive(Debug)]
struct InFlight {
    item: WorkItem,
    /// Canonical outputs the work is producing
    outputs: Vec<String>,
    _permit: OwnedSemaphorePermit,
}

/// Presenter and state machine of a batch reduction.
pub struct ReductionScheduler {
    tree: TreeManager,
    context: Arc<ReductionContext>,
    store: Arc<dyn WorkspaceStore>,
    slot: ExecutionSlot<WorkItem, WorkOutput>,
    completions: mpsc::UnboundedReceiver<WorkCompletion>,
    events: broadcast::Receiver<StoreEvent>,
    events_open: bool,
    /// Rows still to be considered, by group
    queue: BTreeMap<usize, BTreeSet<usize>>,
    /// Groups taking part in the current reduction
    touched: BTreeSet<usize>,
    failed_rows: usize,
    in_flight: Option<InFlight>,
    reducing: bool,
    paused: bool,
    known_workspaces: HashSet<String>,
    /// Table workspace the tree was opened from or saved to
    table_name: Option<String>,
    progress: watch::Sender<Progress>,
    last_summary: Option<String>,
}

impl std::fmt::Debug for ReductionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReductionScheduler")
            .field("tree", &self.tree)
            .field("context", &self.context)
            .field("queue", &self.queue)
            .field("in_flight", &self.in_flight)
            .field("reducing", &self.reducing)
            .field("paused", &self.paused)
            .finish()
    }
}

impl ReductionScheduler {
    /// Returns a scheduler for `tree`, subscribed to notifications from `store`.
    pub fn new(
        tree: TreeManager,
        context: ReductionContext,
        store: Arc<dyn WorkspaceStore>,
    ) -> Result<Self, ReductionError> {
        if tree.whitelist() != &context.whitelist {
            return Err(ReductionError::validation(
                "the tree and the reduction use different columns",
            ));
        }
        let events = store.subscribe();
        let known_workspaces = store.names().into_iter().collect();
        let (slot, completions) = ExecutionSlot::new();
        let (progress, _) = watch::channel(Progress::default());
        Ok(ReductionScheduler {
            tree,
            context: Arc::new(context),
            store,
            slot,
            completions,
            events,
            events_open: true,
            queue: BTreeMap::new(),
            touched: BTreeSet::new(),
            failed_rows: 0,
            in_flight: None,
            reducing: false,
            paused: false,
            known_workspaces,
            table_name: None,
            progress,
            last_summary: None,
        })
    }

    pub fn tree(&self) -> &TreeManager {
        &self.tree
    }

    /// The tree, for structural edits. Fails while a reduction is running.
    pub fn tree_mut(&mut self) -> Result<&mut TreeManager, ReductionError> {
        if self.reducing {
            return Err(ReductionError::Busy);
        }
        Ok(&mut self.tree)
    }

    pub fn context(&self) -> &ReductionContext {
        &self.context
    }

    pub fn is_reducing(&self) -> bool {
        self.reducing
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether a unit of work is in flight.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Summary warning of the last finished reduction, if any node failed.
    pub fn last_summary(&self) -> Option<&str> {
        self.last_summary.as_deref()
    }

    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    /// Whether `name` was in the store when last notified.
    pub fn is_known(&self, name: &str) -> bool {
        self.known_workspaces.contains(name)
    }

    pub fn table_name(&self) -> Option<&str> {
        self.table_name.as_deref()
    }

    /// Start reducing the nodes of `selection` that need processing.
    ///
    /// Rows are checked up front: any row whose options cannot be resolved fails the whole call
    /// with a validation error and nothing is dispatched.
    #[tracing::instrument(level = "DEBUG", skip(self))]
    pub fn process(
        &mut self,
        selection: &Selection,
        request: ProcessRequest,
    ) -> Result<(), ReductionError> {
        if self.reducing {
            return Err(ReductionError::Busy);
        }
        self.drain_store_events();
        let grouped = self.tree.is_grouped();
        let mut plan: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for (g, rows) in self.tree.selected(selection)? {
            let group = self.tree.group(g)?;
            let eligible: BTreeSet<usize> = rows
                .into_iter()
                .filter(|&r| {
                    group
                        .row(r)
                        .map_or(false, |row| request.needs(row.state()))
                })
                .collect();
            if !eligible.is_empty() || (grouped && request.needs(group.state())) {
                plan.insert(g, eligible);
            }
        }

        for (&g, rows) in &plan {
            for &r in rows {
                let row = self.tree.row_mut(g, r)?;
                self.context.resolve_row(row).map_err(|error| {
                    ReductionError::validation(format!("group {} row {}: {}", g, r, error))
                })?;
            }
        }

        let mut total = 0;
        for (&g, rows) in &plan {
            for &r in rows {
                self.tree.row_mut(g, r)?.reset();
            }
            let group = self.tree.group_mut(g)?;
            group.reset();
            total += rows.len();
            // Post-processing only runs if no row is left unprocessed by this reduction.
            let completes = group
                .rows()
                .iter()
                .enumerate()
                .all(|(r, row)| rows.contains(&r) || row.is_processed());
            if grouped && completes && group.len() > 1 && self.context.postprocessing.is_some() {
                total += 1;
            }
        }

        info!(groups = plan.len(), total, "reduction started");
        self.touched = plan.keys().copied().collect();
        self.queue = plan;
        self.failed_rows = 0;
        self.reducing = true;
        self.paused = false;
        self.last_summary = None;
        self.progress.send_replace(Progress { done: 0, total });
        self.process_next_item();
        Ok(())
    }

    /// Reduce everything that has not been processed yet, leaving failed nodes alone.
    pub fn process_all(&mut self) -> Result<(), ReductionError> {
        self.process(&Selection::all(), ProcessRequest::background())
    }

    /// Stop once the item in flight has completed.
    pub fn pause(&mut self) {
        if self.reducing {
            info!("pausing reduction");
            self.paused = true;
        }
    }

    pub fn resume(&mut self) {
        if self.reducing && self.paused {
            info!("resuming reduction");
            self.paused = false;
            self.process_next_item();
        }
    }

    /// Abandon the remaining queue. The item in flight, if any, still completes.
    pub fn stop(&mut self) {
        self.queue.clear();
        self.paused = false;
        if self.in_flight.is_none() && self.reducing {
            self.finish();
        }
    }

    /// Dispatch the next eligible row or group, or finish the reduction if none is left.
    fn process_next_item(&mut self) {
        if self.in_flight.is_some() || !self.reducing {
            return;
        }
        if self.paused {
            debug!("reduction paused");
            return;
        }
        loop {
            let Some((&group, rows)) = self.queue.iter_mut().next() else {
                break;
            };
            match rows.pop_first() {
                Some(row) => {
                    if self.start_row(group, row) {
                        return;
                    }
                }
                None => {
                    self.queue.remove(&group);
                    if self.start_group(group) {
                        return;
                    }
                }
            }
        }
        self.finish();
    }

    /// Returns true if the row was dispatched.
    fn start_row(&mut self, group: usize, index: usize) -> bool {
        let context = self.context.clone();
        let Ok(row) = self.tree.row_mut(group, index) else {
            warn!(group, row = index, "queued row is no longer in the tree");
            return false;
        };
        if row.state() != NodeState::Unprocessed {
            return false;
        }
        let work = match context.resolve_row(row) {
            Ok(()) => row.clone(),
            Err(error) => {
                row.mark_processed(Some(&error.node_message()));
                self.row_failed();
                return false;
            }
        };
        let item = WorkItem::Row { id: work.id() };
        let outputs = work.output_names().to_vec();
        let store = self.store.clone();
        let _span = info_span!("row", group, row = index, name = work.reduced_name()).entered();
        let dispatched = self.slot.dispatch(item.clone(), move || {
            engine::reduce_row(&context, store.as_ref(), work).map(WorkOutput::Row)
        });
        match dispatched {
            Ok(permit) => {
                debug!("row dispatched");
                self.in_flight = Some(InFlight {
                    item,
                    outputs,
                    _permit: permit,
                });
                true
            }
            Err(error) => {
                if let Ok(row) = self.tree.row_mut(group, index) {
                    row.mark_processed(Some(&error.node_message()));
                }
                self.row_failed();
                false
            }
        }
    }

    /// Complete a group whose queued rows are done. Returns true if post-processing was
    /// dispatched.
    fn start_group(&mut self, index: usize) -> bool {
        if !self.tree.is_grouped() {
            return false;
        }
        let Ok(group) = self.tree.group(index) else {
            return false;
        };
        if !group.all_rows_processed() {
            debug!(group = index, "group has unprocessed rows");
            return false;
        }
        if group.len() > 1 {
            if let Some(step) = &self.context.postprocessing {
                let rows = group.rows().to_vec();
                let output = step.output_name(&rows);
                let item = WorkItem::Group { index };
                let context = self.context.clone();
                let store = self.store.clone();
                let _span = info_span!("group", group = index, %output).entered();
                let dispatched = self.slot.dispatch(item.clone(), move || {
                    engine::postprocess_group(&context, store.as_ref(), &rows).map(WorkOutput::Group)
                });
                match dispatched {
                    Ok(permit) => {
                        debug!("post-processing dispatched");
                        self.in_flight = Some(InFlight {
                            item,
                            outputs: vec![output],
                            _permit: permit,
                        });
                        return true;
                    }
                    Err(error) => {
                        let message = format!("post-processing failed: {}", error.node_message());
                        if let Ok(group) = self.tree.group_mut(index) {
                            group.mark_processed(Some(&message));
                        }
                        return false;
                    }
                }
            }
        }
        let error = match group.rows() {
            [row] => row.error().to_string(),
            rows => rows_failed_message(group.failed_rows(), rows.len()),
        };
        if let Ok(group) = self.tree.group_mut(index) {
            group.mark_processed((!error.is_empty()).then_some(error.as_str()));
        }
        false
    }

    fn row_failed(&mut self) {
        self.failed_rows += 1;
        ROWS_PROCESSED.with_label_values(&["failure"]).inc();
        self.progress.send_modify(|progress| progress.done += 1);
    }

    /// Update the tree from a completed unit of work and continue the reduction.
    pub fn handle_completion(&mut self, completion: WorkCompletion) {
        let Some(in_flight) = self.in_flight.take() else {
            warn!(item = ?completion.context, "completion without an item in flight");
            return;
        };
        if in_flight.item != completion.context {
            warn!(expected = ?in_flight.item, item = ?completion.context, "unexpected completion");
        }
        // Releases the execution slot.
        drop(in_flight);
        match completion.context {
            WorkItem::Row { id } => self.finish_row(id, completion.outcome),
            WorkItem::Group { index } => self.finish_group(index, completion.outcome),
        }
        self.progress.send_modify(|progress| progress.done += 1);
        self.process_next_item();
    }

    fn finish_row(&mut self, id: RowId, result: Result<WorkOutput, ReductionError>) {
        ROWS_PROCESSED.with_label_values(&[outcome(&result)]).inc();
        let Some((group, index)) = self.tree.find_row(id) else {
            warn!(id, "completed row is no longer in the tree");
            return;
        };
        let Ok(row) = self.tree.row_mut(group, index) else {
            return;
        };
        match result {
            Ok(WorkOutput::Row(reduced)) if reduced.id() == id => {
                *row = reduced;
                row.mark_processed(None);
                debug!(group, row = index, "row processed");
            }
            Ok(_) => {
                let error = ReductionError::Unknown(format!("unexpected output for row {}", id));
                row.mark_processed(Some(&error.node_message()));
                self.failed_rows += 1;
            }
            Err(error) => {
                let message = error.node_message();
                warn!(group, row = index, %message, "row failed");
                row.mark_processed(Some(&message));
                self.failed_rows += 1;
            }
        }
    }

    fn finish_group(&mut self, index: usize, result: Result<WorkOutput, ReductionError>) {
        GROUPS_POSTPROCESSED
            .with_label_values(&[outcome(&result)])
            .inc();
        let Ok(group) = self.tree.group_mut(index) else {
            warn!(group = index, "completed group is no longer in the tree");
            return;
        };
        let mut errors = Vec::new();
        match result {
            Ok(WorkOutput::Group(output)) => group.set_output_name(&output),
            Ok(_) => errors.push(
                ReductionError::Unknown(format!("unexpected output for group {}", index))
                    .node_message(),
            ),
            Err(error) => errors.push(format!("post-processing failed: {}", error.node_message())),
        }
        let failed = group.failed_rows();
        if failed > 0 {
            errors.push(rows_failed_message(failed, group.len()));
        }
        let error = errors.join("; ");
        if !error.is_empty() {
            warn!(group = index, %error, "group failed");
        }
        group.mark_processed((!error.is_empty()).then_some(error.as_str()));
    }

    fn finish(&mut self) {
        self.reducing = false;
        self.paused = false;
        self.queue.clear();
        let summary = if self.tree.is_grouped() {
            let failed = self
                .touched
                .iter()
                .filter_map(|&g| self.tree.group(g).ok())
                // A partly selected group is never post-processed, so its rows carry the error.
                .filter(|group| group.has_error() || group.rows().iter().any(RowData::has_error))
                .count();
            (failed > 0).then(|| format!("{} groups had errors", failed))
        } else {
            (self.failed_rows > 0).then(|| format!("{} rows had errors", self.failed_rows))
        };
        self.touched.clear();
        info!("reduction finished");
        if let Some(summary) = &summary {
            warn!("{}", summary);
        }
        self.last_summary = summary;
    }

    /// Drive the reduction until nothing is in flight.
    ///
    /// Store notifications are handled before completions, so that changes made by the work in
    /// flight are seen while its outputs are still marked as being produced.
    pub async fn run(&mut self) {
        while self.in_flight.is_some() {
            tokio::select! {
                biased;
                received = self.events.recv(), if self.events_open => self.on_store_event(received),
                completion = self.completions.recv() => match completion {
                    Some(completion) => {
                        self.drain_store_events();
                        self.handle_completion(completion);
                    }
                    None => break,
                },
            }
        }
        self.drain_store_events();
    }

    /// Handle every store notification received so far.
    pub fn drain_store_events(&mut self) {
        while self.events_open {
            match self.events.try_recv() {
                Ok(event) => self.handle_store_event(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Lagged(skipped)) => self.resynchronise(skipped),
                Err(TryRecvError::Closed) => self.events_open = false,
            }
        }
    }

    fn on_store_event(&mut self, received: Result<StoreEvent, RecvError>) {
        match received {
            Ok(event) => self.handle_store_event(event),
            Err(RecvError::Lagged(skipped)) => self.resynchronise(skipped),
            Err(RecvError::Closed) => {
                warn!("workspace store notifications closed");
                self.events_open = false;
            }
        }
    }

    /// React to a change in the workspace store.
    pub fn handle_store_event(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::Added(name) | StoreEvent::Replaced(name) => {
                self.known_workspaces.insert(name);
            }
            StoreEvent::Removed(name) => {
                self.known_workspaces.remove(&name);
                if self.table_name.as_deref() == Some(name.as_str()) {
                    self.table_name = None;
                }
                self.output_removed(&name);
            }
            StoreEvent::Renamed { old, new } => {
                self.known_workspaces.remove(&old);
                self.known_workspaces.insert(new.clone());
                if self.table_name.as_deref() == Some(old.as_str()) {
                    self.table_name = Some(new);
                }
                self.output_removed(&old);
            }
            StoreEvent::Cleared => {
                self.known_workspaces.clear();
                self.table_name = None;
                let count = self
                    .tree
                    .invalidate_all("the workspace store has been cleared");
                warn!(count, "workspace store cleared");
            }
        }
    }

    fn output_removed(&mut self, name: &str) {
        if self.is_in_flight_output(name) {
            debug!(%name, "ignoring removal of an output being produced");
            return;
        }
        let message = ReductionError::StoreConsistency {
            name: name.to_string(),
        }
        .to_string();
        let count = self.tree.invalidate_output(name, &message);
        if count > 0 {
            warn!(%name, count, "output removed from the store");
        }
    }

    /// Whether `name` is, or is a slice of, an output of the item in flight.
    fn is_in_flight_output(&self, name: &str) -> bool {
        let slice_prefix = slice_suffix(0);
        let slice_prefix = slice_prefix.trim_end_matches('0');
        self.in_flight.as_ref().map_or(false, |in_flight| {
            in_flight.outputs.iter().any(|output| {
                name == output
                    || name
                        .strip_prefix(output.as_str())
                        .map_or(false, |rest| rest.starts_with(slice_prefix))
            })
        })
    }

    /// Rebuild the known names from the store and re-check every processed node.
    fn resynchronise(&mut self, skipped: u64) {
        warn!(skipped, "missed workspace store notifications, resynchronising");
        self.known_workspaces = self.store.names().into_iter().collect();
        let store = self.store.clone();
        let count = self.tree.revalidate(
            |name| store.exists(name),
            |name| {
                ReductionError::StoreConsistency {
                    name: name.to_string(),
                }
                .to_string()
            },
        );
        debug!(count, "nodes invalidated after resynchronising");
    }

    /// Processing state of a group, or of one of its rows.
    pub fn node_state(&self, group: usize, row: Option<usize>) -> Result<NodeState, ReductionError> {
        let in_flight = self.in_flight.as_ref().map(|in_flight| &in_flight.item);
        match row {
            Some(index) => {
                let row = self.tree.row(group, index)?;
                if in_flight == Some(&WorkItem::Row { id: row.id() }) {
                    Ok(NodeState::Processing)
                } else {
                    Ok(row.state())
                }
            }
            None => {
                let state = self.tree.group(group)?.state();
                if in_flight == Some(&WorkItem::Group { index: group }) {
                    Ok(NodeState::Processing)
                } else {
                    Ok(state)
                }
            }
        }
    }

    /// Every successfully processed node with its canonical output names, for export.
    pub fn processed_outputs(&self) -> Vec<ProcessedOutput> {
        self.tree
            .processed_outputs(|name| self.known_workspaces.contains(name))
    }

    /// Replace the tree with an empty one.
    pub fn new_table(&mut self) -> Result<(), ReductionError> {
        self.tree_mut()?.new_table();
        self.table_name = None;
        Ok(())
    }

    /// Replace the tree with the contents of the table workspace `name`.
    pub fn open_table(&mut self, name: &str) -> Result<(), ReductionError> {
        let store = self.store.clone();
        self.tree_mut()?.open(store.as_ref(), name)?;
        self.table_name = Some(name.to_string());
        info!(%name, rows = self.tree.number_of_rows(), "table opened");
        Ok(())
    }

    /// Save the tree as the table workspace `name`.
    pub fn save_table(&mut self, name: &str) {
        self.tree.save(self.store.as_ref(), name);
        self.table_name = Some(name.to_string());
    }
}

fn rows_failed_message(failed: usize, total: usize) -> String {
    if failed == 0 {
        String::new()
    } else {
        format!("{} of {} rows failed", failed, total)
    }
}
