/* HTTP publisher: keeps the last-seen record per device key and serves
 * it as text, JSON, or a Prometheus-style exposition under /metrics.
 * Unknown paths fall through to a small embedded dashboard. */

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::{Local, SecondsFormat};
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, info};

use crate::fields::Record;

const INDEX_HTML: &str = include_str!("../assets/index.html");
const STYLE_CSS: &str = include_str!("../assets/style.css");

const TEXT_PLAIN: &str = "text/plain; charset=UTF-8";

struct Page {
    /* The device key, used as the `source` label in /metrics. */
    source: String,
    /* Pre-formatted value+unit strings for the text and JSON views. */
    display: BTreeMap<String, String>,
    /* Numeric values retained for the metrics exposition. */
    raw: BTreeMap<String, f64>,
}

struct WebState {
    root: String,
    pages: RwLock<HashMap<String, Page>>,
}

#[derive(Clone)]
pub struct WebServer {
    state: Arc<WebState>,
}

impl WebServer {
    pub fn new(root: &str) -> WebServer {
        let mut root = if root.is_empty() { "/".to_string() } else { root.to_string() };
        if !root.starts_with('/') {
            root.insert(0, '/');
        }
        if !root.ends_with('/') {
            root.push('/');
        }
        WebServer {
            state: Arc::new(WebState {
                root,
                pages: RwLock::new(HashMap::new()),
            }),
        }
    }

    /* Replace (or with `None`, drop) the page for one device key. Both
     * maps are swapped under one write lock so readers never observe a
     * half-updated page. */
    pub async fn publish(&self, key: &str, record: Option<&Record>) {
        let path = format!("{}{}", self.state.root, key);
        let Some(record) = record else {
            self.state.pages.write().await.remove(&path);
            return;
        };

        let mut display = BTreeMap::new();
        let mut raw = BTreeMap::new();
        for field in record.fields() {
            display.insert(
                field.info.name.clone(),
                format!("{}{}", field.value, field.info.unit),
            );
            if let Some(v) = field.value.as_f64() {
                raw.insert(field.info.name.clone(), v);
            }
        }
        display.insert(
            "last_updated".to_string(),
            Local::now().to_rfc3339_opts(SecondsFormat::Nanos, false),
        );

        let page = Page {
            source: key.to_string(),
            display,
            raw,
        };
        self.state.pages.write().await.insert(path.clone(), page);
        debug!(url = %path, "published to web");
    }

    /* Serve until the shutdown signal fires. */
    pub async fn serve(
        self,
        address: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .fallback(get(page_handler))
            .with_state(Arc::clone(&self.state));
        let listener = tokio::net::TcpListener::bind(address).await?;
        info!("listening on {}", listener.local_addr()?);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
    }

    /* Spawn the accept loop on the runtime; errors end up in the log,
     * never in the poller. */
    pub fn start(&self, address: String, shutdown: watch::Receiver<bool>) {
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(&address, shutdown).await {
                error!(%address, error = %e, "web server failed");
            }
        });
    }
}

async fn page_handler(
    State(state): State<Arc<WebState>>,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let path = uri.path().to_string();
    let pages = state.pages.read().await;
    let Some(page) = pages.get(&path) else {
        drop(pages);
        return static_asset(&path);
    };

    let filter: Option<Vec<&str>> = params
        .get("fields")
        .filter(|f| !f.is_empty())
        .map(|f| f.split(',').collect());
    let entries: Vec<(&String, &String)> = page
        .display
        .iter()
        .filter(|(name, _)| {
            filter
                .as_ref()
                .is_none_or(|names| names.contains(&name.as_str()))
        })
        .collect();

    if params.get("format").map(String::as_str) == Some("json") {
        let map: BTreeMap<&str, &str> = entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let body = match serde_json::to_string(&map) {
            Ok(body) => body,
            Err(e) => {
                error!(%path, error = %e, "error formatting json");
                return (StatusCode::INTERNAL_SERVER_ERROR, "500 server error").into_response();
            }
        };
        return ([(header::CONTENT_TYPE, "application/json")], body).into_response();
    }

    let mut body = String::new();
    for (name, value) in entries {
        body.push_str(name);
        body.push_str(": ");
        body.push_str(value);
        body.push('\n');
    }
    debug!(url = %path, "served from web");
    ([(header::CONTENT_TYPE, TEXT_PLAIN)], body).into_response()
}

async fn metrics_handler(State(state): State<Arc<WebState>>) -> Response {
    let pages = state.pages.read().await;
    let body = metrics_exposition(pages.values());
    ([(header::CONTENT_TYPE, TEXT_PLAIN)], body).into_response()
}

fn metrics_exposition<'a>(pages: impl Iterator<Item = &'a Page>) -> String {
    let mut body = String::new();
    for page in pages {
        for (name, value) in &page.raw {
            body.push_str(&format!(
                "wombatt_{}{{source=\"{}\"}} {}\n",
                metric_name(name),
                page.source,
                value
            ));
        }
    }
    body
}

/* "Grid Side Voltage L1-N" -> "grid_side_voltage_l1_n" */
fn metric_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn static_asset(path: &str) -> Response {
    match path {
        "/" | "/index.html" => ([(header::CONTENT_TYPE, "text/html")], INDEX_HTML).into_response(),
        "/style.css" => ([(header::CONTENT_TYPE, "text/css")], STYLE_CSS).into_response(),
        _ => (StatusCode::NOT_FOUND, "404 page not found").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{RawValue, i16_field, str_field, u16_field};

    fn sample_record() -> Record {
        let mut rec = Record::empty();
        rec.push(
            u16_field("Voltage").unit("V").multiplier(0.01),
            RawValue::Uint(5320),
        );
        rec.push(i16_field("Current").unit("A"), RawValue::Int(10));
        rec.push(str_field("Status"), RawValue::Text("OK".into()));
        rec
    }

    #[tokio::test]
    async fn publish_builds_both_views() {
        let server = WebServer::new("/battery");
        server.publish("1", Some(&sample_record())).await;

        let pages = server.state.pages.read().await;
        let page = pages.get("/battery/1").unwrap();
        assert_eq!(page.display.get("Voltage").unwrap(), "53.2V");
        assert_eq!(page.display.get("Current").unwrap(), "10A");
        assert_eq!(page.display.get("Status").unwrap(), "OK");
        assert!(page.display.contains_key("last_updated"));
        assert_eq!(page.raw.get("Voltage"), Some(&53.2));
        assert_eq!(page.raw.get("Current"), Some(&10.0));
        assert!(!page.raw.contains_key("Status"));
    }

    #[tokio::test]
    async fn metrics_skip_non_numeric_fields() {
        let server = WebServer::new("/battery");
        server.publish("1", Some(&sample_record())).await;

        let pages = server.state.pages.read().await;
        let body = metrics_exposition(pages.values());
        assert!(body.contains("wombatt_voltage{source=\"1\"} 53.2"));
        assert!(body.contains("wombatt_current{source=\"1\"} 10"));
        assert!(!body.lines().any(|l| l.starts_with("wombatt_status")));
    }

    #[tokio::test]
    async fn publish_none_deletes_the_page() {
        let server = WebServer::new("/battery");
        server.publish("1", Some(&sample_record())).await;
        server.publish("1", None).await;
        assert!(server.state.pages.read().await.is_empty());
    }

    #[test]
    fn metric_names_are_snake_case() {
        assert_eq!(metric_name("Grid Side Voltage L1-N"), "grid_side_voltage_l1_n");
        assert_eq!(metric_name("battery_voltage"), "battery_voltage");
        assert_eq!(metric_name("Daily PV Power"), "daily_pv_power");
    }

    #[test]
    fn root_normalization() {
        assert_eq!(WebServer::new("").state.root, "/");
        assert_eq!(WebServer::new("/battery").state.root, "/battery/");
        assert_eq!(WebServer::new("inverter/").state.root, "/inverter/");
    }
}
