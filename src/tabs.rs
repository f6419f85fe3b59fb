//! Stable tab identities over volatile page targets.
//!
//! Browser-side target IDs are opaque and change across restarts; callers
//! get short-lived handles (`tab_1`, `tab_2`, ...) instead. Identity rules:
//!
//! | Rule            | Meaning                                              |
//! |-----------------|------------------------------------------------------|
//! | Stable          | A tab keeps its ID for the target's whole lifetime   |
//! | Never reused    | A retired ID stays retired, even after reconnects    |
//! | Fails loudly    | Operations on a closed tab error, never no-op        |
//!
//! Slots live in an append-only arena; closing a tab retires its slot in
//! place, so every ID ever issued stays resolvable to a definite answer
//! (live target or "closed").
//!
//! Switching is verified: activation is only reported as success once the
//! page observes itself visible AND its own `location`/`title` agree with
//! what the browser reports for the target, with a small bounded retry
//! for window managers that apply focus asynchronously.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::{SessionId, TabId, TargetId};
use crate::protocol::CdpCommand;
use crate::session::SessionMultiplexer;

// ============================================================================
// Constants
// ============================================================================

/// Verified-switch retry bound.
const MAX_SWITCH_ATTEMPTS: u32 = 3;

/// Page created when no URL is given.
const BLANK_PAGE: &str = "about:blank";

// ============================================================================
// TabInfo
// ============================================================================

/// Caller-facing tab description.
#[derive(Debug, Clone, Serialize)]
pub struct TabInfo {
    /// Stable handle.
    pub tab_id: TabId,
    /// Current URL.
    pub url: String,
    /// Current title.
    pub title: String,
    /// Whether this is the currently designated tab.
    pub active: bool,
}

// ============================================================================
// Slot Arena
// ============================================================================

#[derive(Debug)]
struct TabSlot {
    tab_id: TabId,
    target_id: TargetId,
    retired: bool,
}

#[derive(Default)]
struct TabState {
    /// Append-only; retirement happens in place.
    slots: Vec<TabSlot>,
    by_id: FxHashMap<TabId, usize>,
    by_target: FxHashMap<TargetId, usize>,
    /// Index of the currently designated slot.
    current: Option<usize>,
}

impl TabState {
    /// Allocates a fresh slot; the target must not already have one.
    fn allocate(&mut self, target_id: TargetId) -> TabId {
        let tab_id = TabId::next();
        let index = self.slots.len();
        self.slots.push(TabSlot {
            tab_id: tab_id.clone(),
            target_id: target_id.clone(),
            retired: false,
        });
        self.by_id.insert(tab_id.clone(), index);
        self.by_target.insert(target_id, index);
        tab_id
    }

    /// Retires the slot at `index`. The ID stays in the maps so later
    /// lookups answer "closed" rather than "unknown".
    fn retire(&mut self, index: usize) {
        self.slots[index].retired = true;
        if self.current == Some(index) {
            self.current = None;
        }
    }

    fn live_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.retired)
            .map(|(i, _)| i)
    }
}

// ============================================================================
// PageManager
// ============================================================================

/// Tab identity map plus page-level operations.
#[derive(Clone)]
pub struct PageManager {
    state: Arc<Mutex<TabState>>,
    mux: SessionMultiplexer,
}

impl PageManager {
    /// Creates a manager over the given multiplexer.
    #[must_use]
    pub fn new(mux: SessionMultiplexer) -> Self {
        Self {
            state: Arc::new(Mutex::new(TabState::default())),
            mux,
        }
    }

    /// Reconciles the arena with the registry's page targets.
    ///
    /// New page targets get fresh IDs; slots whose target vanished are
    /// retired. Existing assignments never change.
    pub fn ensure_ids(&self) {
        let pages = self.mux.registry().pages();
        let mut state = self.state.lock();

        for target_id in &pages {
            if !state.by_target.contains_key(target_id) {
                let tab_id = state.allocate(target_id.clone());
                debug!(%tab_id, target = %target_id, "Assigned tab identity");
            }
        }

        let gone: Vec<usize> = state
            .live_indices()
            .filter(|&i| !pages.contains(&state.slots[i].target_id))
            .collect();
        for index in gone {
            let tab_id = state.slots[index].tab_id.clone();
            debug!(%tab_id, "Retiring tab whose target is gone");
            state.retire(index);
        }
    }

    /// Lists live tabs in identity order.
    pub fn list(&self) -> Vec<TabInfo> {
        self.ensure_ids();
        let registry = self.mux.registry();
        let state = self.state.lock();

        state
            .live_indices()
            .filter_map(|i| {
                let slot = &state.slots[i];
                let entry = registry.get(&slot.target_id)?;
                Some(TabInfo {
                    tab_id: slot.tab_id.clone(),
                    url: entry.url,
                    title: entry.title,
                    active: state.current == Some(i),
                })
            })
            .collect()
    }

    /// Resolves the active page's routing handles.
    ///
    /// Sticky policy: the designated tab stays active as long as it is
    /// alive; only when it is gone does the first live tab take over.
    /// Explicit switching is the only other way to change designation.
    ///
    /// # Errors
    ///
    /// [`Error::Connection`] when no live page target exists to designate.
    pub fn resolve_active(&self) -> Result<(TabId, TargetId, SessionId)> {
        self.ensure_ids();
        let registry = self.mux.registry();
        let mut state = self.state.lock();

        if let Some(index) = state.current
            && !state.slots[index].retired
            && registry.contains(&state.slots[index].target_id)
            && let Some(session) = self.mux.session_for_target(&state.slots[index].target_id)
        {
            let slot = &state.slots[index];
            return Ok((slot.tab_id.clone(), slot.target_id.clone(), session));
        }

        // Current is gone or was never set; fall back deterministically.
        let fallback = state.live_indices().find(|&i| {
            registry.contains(&state.slots[i].target_id)
                && self.mux.session_for_target(&state.slots[i].target_id).is_some()
        });

        let Some(index) = fallback else {
            return Err(Error::connection("no live page target to designate"));
        };

        state.current = Some(index);
        let slot = &state.slots[index];
        let session = self
            .mux
            .session_for_target(&slot.target_id)
            .ok_or_else(|| Error::target_not_found(slot.target_id.clone()))?;
        info!(tab_id = %slot.tab_id, "Designated fallback active tab");
        Ok((slot.tab_id.clone(), slot.target_id.clone(), session))
    }

    /// Switches to the given tab and verifies the switch took effect.
    ///
    /// Activation is retried up to [`MAX_SWITCH_ATTEMPTS`] times; only a
    /// verified switch updates the designation.
    ///
    /// # Errors
    ///
    /// [`Error::TabClosed`] for a retired ID, [`Error::Config`] for an
    /// unknown one, [`Error::Protocol`] when verification keeps failing.
    pub async fn switch_to(&self, tab_id: &TabId) -> Result<()> {
        let (index, target_id) = self.lookup_live(tab_id)?;
        let session = self
            .mux
            .session_for_target(&target_id)
            .ok_or_else(|| Error::target_not_found(target_id.clone()))?;
        let connection = self.mux.connection()?;

        for attempt in 1..=MAX_SWITCH_ATTEMPTS {
            connection
                .send(CdpCommand::new(
                    "Target.activateTarget",
                    json!({ "targetId": target_id }),
                ))
                .await?;
            connection
                .send(
                    CdpCommand::simple("Page.bringToFront").with_session(session.clone()),
                )
                .await?;

            if self.verify_switch(&target_id, &session).await? {
                self.state.lock().current = Some(index);
                info!(%tab_id, attempt, "Tab switch verified");
                return Ok(());
            }
            warn!(%tab_id, attempt, "Switch not verified yet, retrying activation");
        }

        Err(Error::protocol(format!(
            "tab {tab_id} could not be verified as foreground after \
             {MAX_SWITCH_ATTEMPTS} activation attempts"
        )))
    }

    /// Opens a new tab and designates it current.
    ///
    /// # Errors
    ///
    /// Connection or protocol failure from `Target.createTarget`.
    pub async fn create(&self, url: Option<&str>) -> Result<TabId> {
        let connection = self.mux.connection()?;
        let result = connection
            .send(CdpCommand::new(
                "Target.createTarget",
                json!({ "url": url.unwrap_or(BLANK_PAGE) }),
            ))
            .await?;

        let target_id = result
            .get("targetId")
            .and_then(|v| v.as_str())
            .map(TargetId::new)
            .ok_or_else(|| Error::protocol("Target.createTarget answered without targetId"))?;

        let mut state = self.state.lock();
        // The creation event may have raced us here and assigned a slot.
        let index = match state.by_target.get(&target_id) {
            Some(&i) => i,
            None => {
                let tab_id = state.allocate(target_id.clone());
                debug!(%tab_id, target = %target_id, "Assigned tab identity");
                state.by_id[&tab_id]
            }
        };
        state.current = Some(index);
        let tab_id = state.slots[index].tab_id.clone();
        info!(%tab_id, target = %target_id, "Tab created");
        Ok(tab_id)
    }

    /// Closes the given tab and permanently retires its ID.
    ///
    /// # Errors
    ///
    /// [`Error::TabClosed`] when the tab is already closed,
    /// [`Error::Config`] for an unknown ID.
    pub async fn close(&self, tab_id: &TabId) -> Result<()> {
        let (index, target_id) = self.lookup_live(tab_id)?;

        let connection = self.mux.connection()?;
        connection
            .send(CdpCommand::new(
                "Target.closeTarget",
                json!({ "targetId": target_id }),
            ))
            .await?;

        self.state.lock().retire(index);
        info!(%tab_id, "Tab closed and identity retired");
        Ok(())
    }

    /// Resolves a live slot, failing loudly for closed or unknown IDs.
    fn lookup_live(&self, tab_id: &TabId) -> Result<(usize, TargetId)> {
        let state = self.state.lock();
        let Some(&index) = state.by_id.get(tab_id) else {
            return Err(Error::config(format!("unknown tab id: {tab_id}")));
        };
        let slot = &state.slots[index];
        if slot.retired {
            return Err(Error::tab_closed(tab_id.clone()));
        }
        Ok((index, slot.target_id.clone()))
    }

    /// Confirms the switch actually landed on the requested target.
    ///
    /// Two independent witnesses must agree: the page itself must report
    /// `document.visibilityState == "visible"`, and its own `location.href`
    /// and `document.title` must match what the browser reports for the
    /// target. A stale or misrouted session fails the cross-check instead
    /// of being reported as a successful switch.
    async fn verify_switch(&self, target_id: &TargetId, session: &SessionId) -> Result<bool> {
        let connection = self.mux.connection()?;

        let evaluated = connection
            .send(
                CdpCommand::new(
                    "Runtime.evaluate",
                    json!({
                        "expression": "JSON.stringify({ visibility: document.visibilityState, \
                                       href: location.href, title: document.title })",
                        "returnByValue": true,
                    }),
                )
                .with_session(session.clone()),
            )
            .await?;
        let Some(page_view) = evaluated
            .pointer("/result/value")
            .and_then(|v| v.as_str())
            .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok())
        else {
            return Ok(false);
        };

        if page_view.get("visibility").and_then(|v| v.as_str()) != Some("visible") {
            return Ok(false);
        }

        let info = connection
            .send(CdpCommand::new(
                "Target.getTargetInfo",
                json!({ "targetId": target_id }),
            ))
            .await?;
        let (Some(reported_url), Some(reported_title)) = (
            info.pointer("/targetInfo/url").and_then(|v| v.as_str()),
            info.pointer("/targetInfo/title").and_then(|v| v.as_str()),
        ) else {
            return Ok(false);
        };

        let url_agrees = page_view.get("href").and_then(|v| v.as_str()) == Some(reported_url);
        let title_agrees =
            page_view.get("title").and_then(|v| v.as_str()) == Some(reported_title);
        Ok(url_agrees && title_agrees)
    }
}

// ============================================================================
// Tests
// ============================================================================
