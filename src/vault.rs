use log::{ info, warn };
use std::sync::Arc;
use tokio::sync::broadcast::{ self, error::RecvError };
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::api::VoucherApi;
use crate::error::Result;
use crate::models::voucher::{ Voucher, VoucherFilters, VoucherInsights, VoucherPatch };

const CHANGE_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum VaultChange {
    Vouchers,
    Selection(Option<String>),
    Search(String),
    Insights,
    Loading(bool),
}

#[derive(Default)]
struct VaultInner {
    vouchers: Vec<Voucher>,
    selected_id: Option<String>,
    insights: Option<VoucherInsights>,
    loading: bool,
    search_query: String,
}

/// Client-side cache of vouchers, the current selection and the insights
/// snapshot.
pub struct VaultState {
    api: Arc<dyn VoucherApi>,
    inner: Mutex<VaultInner>,
    changes: broadcast::Sender<VaultChange>,
}

impl VaultState {
    pub fn new(api: Arc<dyn VoucherApi>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            api,
            inner: Mutex::new(VaultInner::default()),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VaultChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: VaultChange) {
        let _ = self.changes.send(change);
    }

    pub async fn vouchers(&self) -> Vec<Voucher> {
        self.inner.lock().await.vouchers.clone()
    }

    pub async fn insights(&self) -> Option<VoucherInsights> {
        self.inner.lock().await.insights.clone()
    }

    pub async fn is_loading(&self) -> bool {
        self.inner.lock().await.loading
    }

    pub async fn search_query(&self) -> String {
        self.inner.lock().await.search_query.clone()
    }

    pub async fn selected_id(&self) -> Option<String> {
        self.inner.lock().await.selected_id.clone()
    }

    /// The selected voucher, if the id is set and still cached.
    pub async fn selected(&self) -> Option<Voucher> {
        let inner = self.inner.lock().await;
        let id = inner.selected_id.as_deref()?;
        inner.vouchers
            .iter()
            .find(|v| v.id == id)
            .cloned()
    }

    /// Vouchers matching the search query; everything when it is empty.
    pub async fn filtered(&self) -> Vec<Voucher> {
        let inner = self.inner.lock().await;
        let needle = inner.search_query.to_lowercase();
        if needle.is_empty() {
            return inner.vouchers.clone();
        }
        inner.vouchers
            .iter()
            .filter(|v| v.matches(&needle))
            .cloned()
            .collect()
    }

    pub async fn select_voucher(&self, id: &str) {
        self.inner.lock().await.selected_id = Some(id.to_string());
        self.notify(VaultChange::Selection(Some(id.to_string())));
    }

    pub async fn clear_selection(&self) {
        self.inner.lock().await.selected_id = None;
        self.notify(VaultChange::Selection(None));
    }

    pub async fn set_search_query(&self, query: &str) {
        self.inner.lock().await.search_query = query.to_string();
        self.notify(VaultChange::Search(query.to_string()));
    }

    /// Replaces the cached list with the server's page.
    pub async fn load_vouchers(&self, filters: &VoucherFilters) -> Result<()> {
        self.set_loading(true).await;
        let result = self.api.get_vouchers(filters).await;
        let outcome = match result {
            Ok(vouchers) => {
                info!("Loaded {} vouchers", vouchers.len());
                self.inner.lock().await.vouchers = vouchers;
                self.notify(VaultChange::Vouchers);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to load vouchers: {}", e);
                Err(e)
            }
        };
        self.set_loading(false).await;
        outcome
    }

    async fn set_loading(&self, loading: bool) {
        self.inner.lock().await.loading = loading;
        self.notify(VaultChange::Loading(loading));
    }

    /// Refreshes the insights snapshot. Failures keep the previous one.
    pub async fn load_insights(&self) {
        match self.api.get_insights().await {
            Ok(insights) => {
                self.inner.lock().await.insights = Some(insights);
                self.notify(VaultChange::Insights);
            }
            Err(e) => warn!("Failed to load insights: {}", e),
        }
    }

    /// Replaces a voucher in place, or puts a new one first.
    pub async fn add_or_update(&self, voucher: Voucher) {
        {
            let mut inner = self.inner.lock().await;
            match inner.vouchers.iter().position(|v| v.id == voucher.id) {
                Some(idx) => {
                    inner.vouchers[idx] = voucher;
                }
                None => inner.vouchers.insert(0, voucher),
            }
        }
        self.notify(VaultChange::Vouchers);
    }

    /// Sends a partial update and caches the server's copy.
    pub async fn patch_voucher(&self, id: &str, patch: &VoucherPatch) -> Result<Voucher> {
        let updated = self.api.update_voucher(id, patch).await?;
        self.add_or_update(updated.clone()).await;
        self.load_insights().await;
        Ok(updated)
    }

    /// Fetches one voucher and caches it.
    pub async fn refresh_voucher(&self, id: &str) -> Result<Voucher> {
        let voucher = self.api.get_voucher_by_id(id).await?;
        self.add_or_update(voucher.clone()).await;
        Ok(voucher)
    }

    /// Caches a voucher produced by a chat turn and refreshes insights.
    pub async fn apply_analyzed(&self, voucher: Voucher) {
        self.add_or_update(voucher).await;
        self.load_insights().await;
    }

    /// Applies every voucher that arrives on `analyzed` until the sender is gone.
    pub fn follow(self: &Arc<Self>, mut analyzed: broadcast::Receiver<Voucher>) -> JoinHandle<()> {
        let vault = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match analyzed.recv().await {
                    Ok(voucher) => vault.apply_analyzed(voucher).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Vault missed {} analyzed vouchers; reloading may be needed", skipped);
                    }
                    Err(RecvError::Closed) => {
                        break;
                    }
                }
            }
        })
    }
}
