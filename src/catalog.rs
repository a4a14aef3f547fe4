use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::domain::date_stamp;
use crate::error::SyncError;
use crate::retry::{RetryPolicy, classify_http_error, send_with_retries};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Raw operations against a raster catalog (GeoServer REST).
pub trait CatalogClient: Send + Sync {
    fn delete_store(&self, store: &str) -> Result<HttpReply, SyncError>;
    fn upload_geotiff(&self, store: &str, file: &Path) -> Result<HttpReply, SyncError>;
    fn configure_coverage(&self, store: &str, body: &Value) -> Result<HttpReply, SyncError>;
}

#[derive(Debug, Clone)]
pub struct CatalogEndpoint {
    /// Primary URL first, then fallbacks.
    pub urls: Vec<String>,
    pub username: String,
    pub password: String,
    pub workspace: String,
    pub timeout: Duration,
}

pub struct GeoServerHttpClient {
    client: Client,
    endpoint: CatalogEndpoint,
    retry: RetryPolicy,
    resolved: Mutex<Option<String>>,
}

impl GeoServerHttpClient {
    pub fn new(endpoint: CatalogEndpoint, retry: RetryPolicy) -> Result<Self, SyncError> {
        if endpoint.urls.is_empty() {
            return Err(SyncError::Config("GEOSERVER_URL".to_string()));
        }
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("floodsync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::CatalogHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(endpoint.timeout)
            .connect_timeout(endpoint.timeout)
            .build()
            .map_err(|err| SyncError::CatalogHttp(err.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            retry,
            resolved: Mutex::new(None),
        })
    }

    /// The base URL chosen for this client; resolved on first use and then fixed.
    pub fn base_url(&self) -> Result<String, SyncError> {
        let mut resolved = self
            .resolved
            .lock()
            .map_err(|_| SyncError::CatalogHttp("endpoint lock poisoned".to_string()))?;
        if let Some(url) = resolved.as_ref() {
            return Ok(url.clone());
        }
        let url = resolve_endpoint(&self.endpoint.urls, |candidate| self.probe(candidate))?;
        *resolved = Some(url.clone());
        Ok(url)
    }

    fn probe(&self, base: &str) -> Result<(), SyncError> {
        let url = format!("{}/rest/about/version.json", base.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .basic_auth(&self.endpoint.username, Some(&self.endpoint.password))
            .send()
            .map_err(|err| classify_http_error(&err))?;
        debug!(url = %url, status = resp.status().as_u16(), "catalog probe answered");
        Ok(())
    }

    fn store_url(&self, store: &str) -> Result<String, SyncError> {
        Ok(format!(
            "{}/rest/workspaces/{}/coveragestores/{}",
            self.base_url()?.trim_end_matches('/'),
            self.endpoint.workspace,
            store
        ))
    }

    fn reply(resp: reqwest::blocking::Response) -> HttpReply {
        let status = resp.status().as_u16();
        let body = resp.text().unwrap_or_default();
        HttpReply { status, body }
    }
}

impl CatalogClient for GeoServerHttpClient {
    fn delete_store(&self, store: &str) -> Result<HttpReply, SyncError> {
        let url = format!("{}?recurse=true", self.store_url(store)?);
        let resp = send_with_retries(&self.retry, store, || {
            self.client
                .delete(&url)
                .basic_auth(&self.endpoint.username, Some(&self.endpoint.password))
        })?;
        Ok(Self::reply(resp))
    }

    fn upload_geotiff(&self, store: &str, file: &Path) -> Result<HttpReply, SyncError> {
        let url = format!("{}/file.geotiff", self.store_url(store)?);
        let bytes = fs::read(file).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let resp = send_with_retries(&self.retry, store, || {
            self.client
                .put(&url)
                .basic_auth(&self.endpoint.username, Some(&self.endpoint.password))
                .header(CONTENT_TYPE, "image/tiff")
                .body(bytes.clone())
        })?;
        Ok(Self::reply(resp))
    }

    fn configure_coverage(&self, store: &str, body: &Value) -> Result<HttpReply, SyncError> {
        let url = format!("{}/coverages", self.store_url(store)?);
        let resp = send_with_retries(&self.retry, store, || {
            self.client
                .post(&url)
                .basic_auth(&self.endpoint.username, Some(&self.endpoint.password))
                .json(body)
        })?;
        Ok(Self::reply(resp))
    }
}

/// Picks the first reachable URL. Only unreachability moves on to the next candidate.
pub fn resolve_endpoint<F>(candidates: &[String], mut probe: F) -> Result<String, SyncError>
where
    F: FnMut(&str) -> Result<(), SyncError>,
{
    let mut last_error = None;
    for (index, candidate) in candidates.iter().enumerate() {
        match probe(candidate) {
            Ok(()) => {
                if index > 0 {
                    warn!(url = %candidate, "primary catalog unreachable, using fallback endpoint");
                } else {
                    info!(url = %candidate, "catalog endpoint reachable");
                }
                return Ok(candidate.clone());
            }
            Err(err @ (SyncError::Connection(_) | SyncError::Timeout(_))) => {
                warn!(url = %candidate, error = %err, "catalog endpoint unreachable");
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_error.unwrap_or_else(|| SyncError::Config("GEOSERVER_URL".to_string())))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Absent,
    Uploaded,
    Published,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedEntry {
    pub product: String,
    pub entry: String,
    pub state: EntryState,
    pub metadata_warning: Option<String>,
}

/// Catalog entries are named `{product}_{YYYYMMDD}`.
pub fn entry_name(product: &str, date: NaiveDate) -> String {
    format!("{product}_{}", date_stamp(date))
}

/// Drives one catalog entry from absent to published.
pub struct CatalogPublisher<'a, C: CatalogClient + ?Sized> {
    client: &'a C,
}

impl<'a, C: CatalogClient + ?Sized> CatalogPublisher<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    /// 404 means there was nothing to delete.
    pub fn delete_if_exists(&self, entry: &str) -> Result<EntryState, SyncError> {
        let reply = self.client.delete_store(entry)?;
        if reply.is_success() || reply.status == 404 {
            debug!(entry, status = reply.status, "catalog entry cleared");
            return Ok(EntryState::Absent);
        }
        Err(SyncError::Publish {
            product: entry.to_string(),
            status: reply.status,
            message: reply.body,
        })
    }

    pub fn upload(&self, entry: &str, file: &Path) -> Result<EntryState, SyncError> {
        let reply = self.client.upload_geotiff(entry, file)?;
        if !reply.is_success() {
            return Err(SyncError::Publish {
                product: entry.to_string(),
                status: reply.status,
                message: reply.body,
            });
        }
        info!(entry, status = reply.status, "raster uploaded");
        Ok(EntryState::Uploaded)
    }

    pub fn configure_metadata(
        &self,
        entry: &str,
        product: &str,
        date: NaiveDate,
        hour: u32,
    ) -> Result<EntryState, SyncError> {
        let body = coverage_body(entry, product, date, hour);
        let reply = self.client.configure_coverage(entry, &body)?;
        if !reply.is_success() {
            return Err(SyncError::Publish {
                product: entry.to_string(),
                status: reply.status,
                message: reply.body,
            });
        }
        Ok(EntryState::Published)
    }

    /// Delete, upload, then attach the time dimension; metadata failure only warns.
    pub fn publish(
        &self,
        product: &str,
        date: NaiveDate,
        hour: u32,
        file: &Path,
    ) -> Result<PublishedEntry, SyncError> {
        let entry = entry_name(product, date);
        self.delete_if_exists(&entry)?;
        let mut state = self.upload(&entry, file)?;
        let mut metadata_warning = None;
        match self.configure_metadata(&entry, product, date, hour) {
            Ok(next) => state = next,
            Err(err) => {
                warn!(entry = %entry, error = %err, "time dimension not configured, raster still served");
                metadata_warning = Some(err.to_string());
            }
        }
        info!(product, entry = %entry, state = ?state, "catalog publish finished");
        Ok(PublishedEntry {
            product: product.to_string(),
            entry,
            state,
            metadata_warning,
        })
    }
}

pub fn coverage_body(entry: &str, product: &str, date: NaiveDate, hour: u32) -> Value {
    let iso = format!("{}T{hour:02}:00:00Z", date.format("%Y-%m-%d"));
    json!({
        "coverage": {
            "name": entry,
            "title": format!("{product} for {}", date.format("%Y-%m-%d")),
            "enabled": true,
            "metadata": {
                "entry": [
                    {
                        "@key": "time",
                        "dimensionInfo": {
                            "enabled": true,
                            "presentation": "LIST",
                            "units": "ISO8601",
                            "defaultValue": iso,
                            "strategy": "FIXED",
                            "reference": "TIME"
                        }
                    },
                    { "@key": "time", "$": iso }
                ]
            },
            "parameters": {
                "entry": [ { "string": ["time", iso] } ]
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    struct Scripted {
        delete: u16,
        upload: u16,
        configure: u16,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(delete: u16, upload: u16, configure: u16) -> Self {
            Self {
                delete,
                upload,
                configure,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn answer(&self, call: String, status: u16) -> Result<HttpReply, SyncError> {
            self.calls.lock().unwrap().push(call);
            Ok(HttpReply {
                status,
                body: String::new(),
            })
        }
    }

    impl CatalogClient for Scripted {
        fn delete_store(&self, store: &str) -> Result<HttpReply, SyncError> {
            self.answer(format!("DELETE {store}"), self.delete)
        }

        fn upload_geotiff(&self, store: &str, _file: &Path) -> Result<HttpReply, SyncError> {
            self.answer(format!("PUT {store}"), self.upload)
        }

        fn configure_coverage(&self, store: &str, _body: &Value) -> Result<HttpReply, SyncError> {
            self.answer(format!("POST {store}"), self.configure)
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 9).unwrap()
    }

    #[test]
    fn fresh_name_reaches_published() {
        let client = Scripted::new(404, 201, 201);
        let entry = CatalogPublisher::new(&client)
            .publish("flood_hazard", date(), 0, Path::new("x.tif"))
            .unwrap();
        assert_eq!(entry.entry, "flood_hazard_20250109");
        assert_eq!(entry.state, EntryState::Published);
        assert_eq!(
            *client.calls.lock().unwrap(),
            vec![
                "DELETE flood_hazard_20250109",
                "PUT flood_hazard_20250109",
                "POST flood_hazard_20250109"
            ]
        );
    }

    #[test]
    fn metadata_failure_leaves_entry_uploaded() {
        let client = Scripted::new(200, 201, 400);
        let entry = CatalogPublisher::new(&client)
            .publish("group1_alert", date(), 0, Path::new("x.tif"))
            .unwrap();
        assert_eq!(entry.state, EntryState::Uploaded);
        assert!(entry.metadata_warning.is_some());
    }

    #[test]
    fn rejected_upload_is_a_publish_error() {
        let client = Scripted::new(404, 415, 201);
        let err = CatalogPublisher::new(&client)
            .publish("group2_alert", date(), 0, Path::new("x.tif"))
            .unwrap_err();
        assert_matches!(err, SyncError::Publish { status: 415, .. });
        assert_eq!(client.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn server_error_on_delete_is_not_absent() {
        let client = Scripted::new(500, 201, 201);
        let err = CatalogPublisher::new(&client)
            .delete_if_exists("x")
            .unwrap_err();
        assert_matches!(err, SyncError::Publish { status: 500, .. });
    }

    #[test]
    fn unreachable_primary_falls_back_once() {
        let urls = vec!["http://primary".to_string(), "http://secondary".to_string()];
        let mut probed = Vec::new();
        let chosen = resolve_endpoint(&urls, |url| {
            probed.push(url.to_string());
            if url.contains("primary") {
                Err(SyncError::Connection("refused".to_string()))
            } else {
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(chosen, "http://secondary");
        assert_eq!(probed.len(), 2);
    }

    #[test]
    fn coverage_body_carries_time_dimension() {
        let body = coverage_body("flood_hazard_20250109", "flood_hazard", date(), 0);
        let coverage = &body["coverage"];
        assert_eq!(coverage["title"], "flood_hazard for 2025-01-09");
        assert_eq!(
            coverage["metadata"]["entry"][0]["dimensionInfo"]["defaultValue"],
            "2025-01-09T00:00:00Z"
        );
        assert_eq!(coverage["parameters"]["entry"][0]["string"][1], "2025-01-09T00:00:00Z");
    }
}
