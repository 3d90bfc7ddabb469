//! Admin dashboard backend.
//!
//! Thin mapping from the backend traits onto the dashboard's REST endpoints.
//! Responses may be bare objects or wrapped in `{ "data": ... }`.

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::info;

use super::{CheckoutBackend, CollectionBackend};
use crate::api::ApiClient;
use crate::error::BackendError;
use crate::models::{
    CommittedTransaction, Expense, ExpenseFilters, ExpenseInput, Page, TransactionHeader,
    TransactionLine, VoucherExpense, VOUCHER_EXPENSE_TYPE,
};

const CHECKOUT_PATH: &str = "/api/pos/checkout";
const EXPENSES_PATH: &str = "/api/pos/expenses";

pub struct HttpBackend {
    api: ApiClient,
}

impl HttpBackend {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, BackendError> {
    let payload = match value {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };
    serde_json::from_value(payload)
        .map_err(|e| BackendError::Transient(format!("Unexpected response shape: {e}")))
}

#[async_trait]
impl CheckoutBackend for HttpBackend {
    async fn commit(
        &self,
        header: &TransactionHeader,
        lines: &[TransactionLine],
    ) -> Result<CommittedTransaction, BackendError> {
        let body = json!({ "header": header, "lines": lines });
        let resp = self
            .api
            .request(Method::POST, CHECKOUT_PATH, &[], Some(&body))
            .await
            .map_err(|e| match e {
                // Older dashboards omit the id from the conflict body
                BackendError::UniqueViolation { submission_id } if submission_id.is_empty() => {
                    BackendError::UniqueViolation {
                        submission_id: header.submission_id.clone(),
                    }
                }
                other => other,
            })?;
        let committed: CommittedTransaction = decode(resp)?;
        info!(
            submission_id = %committed.submission_id,
            transaction_id = %committed.id,
            "Checkout committed via admin dashboard"
        );
        Ok(committed)
    }

    async fn fetch_by_submission_id(
        &self,
        submission_id: &str,
    ) -> Result<Option<CommittedTransaction>, BackendError> {
        let path = format!("{CHECKOUT_PATH}/{submission_id}");
        match self.api.request(Method::GET, &path, &[], None).await {
            Ok(Value::Null) => Ok(None),
            Ok(v) => decode(v).map(Some),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn record_voucher_expense(&self, entry: &VoucherExpense) -> Result<(), BackendError> {
        let body = voucher_body(entry);
        match self
            .api
            .request(Method::POST, EXPENSES_PATH, &[], Some(&body))
            .await
        {
            Ok(_) => Ok(()),
            // Already recorded for this checkout
            Err(BackendError::UniqueViolation { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn recent_transactions(
        &self,
        limit: u32,
    ) -> Result<Vec<CommittedTransaction>, BackendError> {
        let path = format!("{CHECKOUT_PATH}/recent");
        let resp = self
            .api
            .request(Method::GET, &path, &[("limit", limit.to_string())], None)
            .await?;
        decode(resp)
    }
}

fn voucher_body(entry: &VoucherExpense) -> Value {
    json!({
        "amount": entry.amount,
        "description": entry.description(),
        "expenseType": VOUCHER_EXPENSE_TYPE,
        "expenseDate": entry.expense_date,
        "operatorId": entry.operator_id,
        "sourceSubmissionId": entry.submission_id,
    })
}

fn filter_query(page: u32, page_size: u32, filters: &ExpenseFilters) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("page", page.to_string()),
        ("pageSize", page_size.to_string()),
    ];
    if let Some(from) = filters.from {
        query.push(("from", from.to_string()));
    }
    if let Some(to) = filters.to {
        query.push(("to", to.to_string()));
    }
    if let Some(t) = filters.expense_type.as_deref() {
        query.push(("type", t.to_string()));
    }
    query
}

#[async_trait]
impl CollectionBackend<Expense> for HttpBackend {
    async fn create(&self, input: &ExpenseInput) -> Result<Expense, BackendError> {
        let body = serde_json::to_value(input)
            .map_err(|e| BackendError::Rejected(format!("Invalid expense: {e}")))?;
        let resp = self
            .api
            .request(Method::POST, EXPENSES_PATH, &[], Some(&body))
            .await?;
        decode(resp)
    }

    async fn update(&self, id: &str, input: &ExpenseInput) -> Result<Expense, BackendError> {
        let body = serde_json::to_value(input)
            .map_err(|e| BackendError::Rejected(format!("Invalid expense: {e}")))?;
        let path = format!("{EXPENSES_PATH}/{id}");
        let resp = self
            .api
            .request(Method::PATCH, &path, &[], Some(&body))
            .await?;
        decode(resp)
    }

    async fn delete(&self, id: &str) -> Result<(), BackendError> {
        let path = format!("{EXPENSES_PATH}/{id}");
        self.api.request(Method::DELETE, &path, &[], None).await?;
        Ok(())
    }

    async fn list_page(
        &self,
        page: u32,
        page_size: u32,
        filters: &ExpenseFilters,
    ) -> Result<Page<Expense>, BackendError> {
        let query = filter_query(page, page_size, filters);
        let resp = self
            .api
            .request(Method::GET, EXPENSES_PATH, &query, None)
            .await?;
        decode(resp)
    }
}
