//! Foreign-exchange rate lookup.
//!
//! Cross-currency scoring asks for the rate effective on the transaction
//! date. A missing rate is not an error: the source returns `None` and the
//! cross-currency signal abstains for that pair.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use service_core::error::AppError;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

/// Source of foreign-exchange rates.
#[async_trait]
pub trait FxRateSource: Send + Sync {
    /// Rate converting one unit of `from` into `to`, effective on `as_of`.
    ///
    /// `Ok(None)` means no rate is published for that pair and date.
    async fn rate(
        &self,
        from: &str,
        to: &str,
        as_of: NaiveDate,
    ) -> Result<Option<Decimal>, AppError>;
}

#[derive(Debug, Deserialize)]
struct RateResponse {
    rate: Decimal,
}

/// Rate source backed by an HTTP rate service.
pub struct HttpFxRateProvider {
    base_url: String,
    client: Client,
}

impl HttpFxRateProvider {
    pub fn new(base_url: String, timeout_secs: u64) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| {
                AppError::InternalError(anyhow::anyhow!("Failed to build FX client: {}", e))
            })?;
        Ok(Self { base_url, client })
    }
}

#[async_trait]
impl FxRateSource for HttpFxRateProvider {
    async fn rate(
        &self,
        from: &str,
        to: &str,
        as_of: NaiveDate,
    ) -> Result<Option<Decimal>, AppError> {
        if from == to {
            return Ok(Some(Decimal::ONE));
        }

        let response = self
            .client
            .get(format!("{}/rates", self.base_url))
            .query(&[("from", from), ("to", to), ("date", &as_of.to_string())])
            .send()
            .await
            .map_err(|e| {
                AppError::Transient(anyhow::anyhow!("FX rate service unreachable: {}", e))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(from = %from, to = %to, as_of = %as_of, "No FX rate published");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(AppError::Transient(anyhow::anyhow!(
                "FX rate service returned status {}",
                response.status()
            )));
        }

        let body: RateResponse = response.json().await.map_err(|e| {
            AppError::DataIntegrity(anyhow::anyhow!("Malformed FX rate payload: {}", e))
        })?;

        Ok(Some(body.rate))
    }
}

/// In-process rate table with effective-dated entries.
///
/// A lookup returns the most recent rate whose effective date is on or
/// before the requested date. Used when no external rate service is
/// configured, and by tests.
#[derive(Default)]
pub struct FixedFxRates {
    rates: HashMap<(String, String), BTreeMap<NaiveDate, Decimal>>,
}

impl FixedFxRates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, from: &str, to: &str, effective: NaiveDate, rate: Decimal) {
        self.rates
            .entry((from.to_string(), to.to_string()))
            .or_default()
            .insert(effective, rate);
    }
}

#[async_trait]
impl FxRateSource for FixedFxRates {
    async fn rate(
        &self,
        from: &str,
        to: &str,
        as_of: NaiveDate,
    ) -> Result<Option<Decimal>, AppError> {
        if from == to {
            return Ok(Some(Decimal::ONE));
        }
        let rate = self
            .rates
            .get(&(from.to_string(), to.to_string()))
            .and_then(|by_date| by_date.range(..=as_of).next_back())
            .map(|(_, rate)| *rate);
        Ok(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn fixed_rates_use_most_recent_effective_date() {
        let mut rates = FixedFxRates::new();
        rates.insert("EUR", "USD", date(2024, 1, 1), Decimal::new(1050, 3));
        rates.insert("EUR", "USD", date(2024, 2, 1), Decimal::new(1075, 3));

        let on_jan = rates.rate("EUR", "USD", date(2024, 1, 15)).await.unwrap();
        assert_eq!(on_jan, Some(Decimal::new(1050, 3)));

        let on_feb = rates.rate("EUR", "USD", date(2024, 2, 10)).await.unwrap();
        assert_eq!(on_feb, Some(Decimal::new(1075, 3)));
    }

    #[tokio::test]
    async fn fixed_rates_return_none_before_first_effective_date() {
        let mut rates = FixedFxRates::new();
        rates.insert("EUR", "USD", date(2024, 2, 1), Decimal::new(1075, 3));

        let before = rates.rate("EUR", "USD", date(2024, 1, 15)).await.unwrap();
        assert_eq!(before, None);
    }

    #[tokio::test]
    async fn fixed_rates_return_none_for_unknown_pair() {
        let rates = FixedFxRates::new();
        let rate = rates.rate("GBP", "JPY", date(2024, 3, 1)).await.unwrap();
        assert_eq!(rate, None);
    }

    #[tokio::test]
    async fn same_currency_is_identity() {
        let rates = FixedFxRates::new();
        let rate = rates.rate("USD", "USD", date(2024, 3, 1)).await.unwrap();
        assert_eq!(rate, Some(Decimal::ONE));
    }
}
