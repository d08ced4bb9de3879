use crate::error::{AppError, AppResult};
use crate::models::PricingTier;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::warn;

/// Read-only tier prices of catalog items
#[async_trait]
pub trait CatalogPriceLookup: Send + Sync {
    async fn get_tier_prices(&self, item_id: &str) -> AppResult<PricingTier>;
}

/// Fixed in-memory price list
#[derive(Default)]
pub struct StaticCatalog {
    items: RwLock<HashMap<String, PricingTier>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_item(self, item_id: impl Into<String>, tier: PricingTier) -> Self {
        self.insert(item_id, tier);
        self
    }

    pub fn insert(&self, item_id: impl Into<String>, tier: PricingTier) {
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        items.insert(item_id.into(), tier);
    }
}

#[async_trait]
impl CatalogPriceLookup for StaticCatalog {
    async fn get_tier_prices(&self, item_id: &str) -> AppResult<PricingTier> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        items
            .get(item_id)
            .copied()
            .ok_or_else(|| AppError::NotFound(format!("catalog item {}", item_id)))
    }
}

/// Catalog service reached over HTTP: `GET {base}/items/{id}/pricing`
pub struct HttpCatalog {
    base_url: Url,
    client: Client,
}

impl HttpCatalog {
    pub fn new(base_url: impl Into<String>) -> AppResult<Self> {
        let raw = base_url.into();
        let base_url = Url::parse(&raw)
            .map_err(|e| AppError::Config(format!("Invalid catalog url {}: {}", raw, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Config(format!("Invalid catalog url {}", raw)));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build catalog client: {}", e)))?;

        Ok(Self { base_url, client })
    }

    /// Item ids go in as one encoded path segment
    fn pricing_url(&self, item_id: &str) -> AppResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Config(format!("Invalid catalog url {}", self.base_url)))?
            .pop_if_empty()
            .extend(["items", item_id, "pricing"]);
        Ok(url)
    }
}

#[async_trait]
impl CatalogPriceLookup for HttpCatalog {
    async fn get_tier_prices(&self, item_id: &str) -> AppResult<PricingTier> {
        let url = self.pricing_url(item_id)?;

        let response = self.client.get(url).send().await.map_err(|e| {
            warn!(item_id, "Catalog lookup failed: {}", e);
            AppError::ExternalService(format!("catalog unreachable: {}", e))
        })?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(AppError::NotFound(format!("catalog item {}", item_id))),
            status if !status.is_success() => Err(AppError::ExternalService(format!(
                "catalog answered {} for item {}",
                status, item_id
            ))),
            _ => {
                let tier = response
                    .json::<PricingTier>()
                    .await
                    .map_err(|e| AppError::ExternalService(format!("bad catalog payload: {}", e)))?;
                tier.validate()?;
                Ok(tier)
            }
        }
    }
}
