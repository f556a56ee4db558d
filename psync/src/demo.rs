//! Vehicle listing domain used by the `psync demo` command and the tests
//!
//! Supplies the pieces a real data domain plugs in: a filter type, its URL
//! mapper, an API adapter and an options source, all in memory.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Result, eyre};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::Config;
use crate::location::{HistoryNavigator, LocationParams, LocationState, ParamPatch};
use crate::options::{FilterOption, FilterOptionsCache, OptionsSource};
use crate::request::{FetchError, RequestCoordinator};
use crate::resource::{ApiAdapter, ApiResponse, Data, Highlights, ResourceOrchestrator, ResourceState, UrlMapper};
use crate::sync::{ChannelHub, PopOutContext, PopOutManager, PrimaryBridge, SimulatedWindowHost};

const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub by: String,
    pub order: SortOrder,
}

/// Filters of the vehicle listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleFilters {
    pub manufacturer: Option<String>,
    pub models: Vec<String>,
    pub year_min: Option<i64>,
    pub year_max: Option<i64>,
    pub page: u32,
    pub size: u32,
    pub sort: Option<Sort>,
}

impl Default for VehicleFilters {
    fn default() -> Self {
        Self {
            manufacturer: None,
            models: Vec::new(),
            year_min: None,
            year_max: None,
            page: 1,
            size: DEFAULT_PAGE_SIZE,
            sort: None,
        }
    }
}

/// Maps [`VehicleFilters`] to `manufacturer`, `models`, `yearMin`, `yearMax`,
/// `page`, `size`, `sortBy` and `sortOrder`
pub struct VehicleUrlMapper;

impl UrlMapper<VehicleFilters> for VehicleUrlMapper {
    fn to_params(&self, filters: &VehicleFilters) -> LocationParams {
        let mut params = LocationParams::new()
            .with("page", filters.page)
            .with("size", filters.size)
            .with("models", filters.models.clone())
            .with("manufacturer", filters.manufacturer.clone().unwrap_or_default());
        if let Some(year) = filters.year_min {
            params.insert("yearMin", year);
        }
        if let Some(year) = filters.year_max {
            params.insert("yearMax", year);
        }
        if let Some(sort) = &filters.sort {
            params.insert("sortBy", sort.by.clone());
            let order = match sort.order {
                SortOrder::Asc => "asc",
                SortOrder::Desc => "desc",
            };
            params.insert("sortOrder", order);
        }
        params
    }

    fn from_params(&self, params: &LocationParams) -> VehicleFilters {
        let positive = |key: &str, default: u32| {
            params
                .get_i64(key)
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(default)
        };
        let sort = params.get_str("sortBy").map(|by| Sort {
            by,
            order: match params.get_str("sortOrder").as_deref() {
                Some("desc") => SortOrder::Desc,
                _ => SortOrder::Asc,
            },
        });
        VehicleFilters {
            manufacturer: params.get_str("manufacturer").filter(|m| !m.is_empty()),
            models: params.get_list("models").into_iter().filter(|m| !m.is_empty()).collect(),
            year_min: params.get_i64("yearMin"),
            year_max: params.get_i64("yearMax"),
            page: positive("page", 1),
            size: positive("size", DEFAULT_PAGE_SIZE),
            sort,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: u32,
    pub manufacturer: String,
    pub model: String,
    pub year: i64,
    pub price: u64,
    #[serde(default)]
    pub highlighted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleStatistics {
    pub average_price: u64,
    pub by_manufacturer: BTreeMap<String, u64>,
}

fn inventory() -> Vec<Vehicle> {
    let rows = [
        ("Ford", "F-150", 2021, 42_000),
        ("Ford", "Mustang", 2019, 35_000),
        ("Ford", "Explorer", 2022, 38_000),
        ("Ford", "Bronco", 2023, 45_000),
        ("Tesla", "Model 3", 2022, 40_000),
        ("Tesla", "Model Y", 2023, 52_000),
        ("Tesla", "Model S", 2020, 79_000),
        ("Toyota", "Camry", 2021, 26_000),
        ("Toyota", "RAV4", 2022, 29_000),
        ("Toyota", "Prius", 2019, 24_000),
        ("Honda", "Civic", 2020, 22_000),
        ("Honda", "Accord", 2023, 28_000),
    ];
    rows.iter()
        .zip(1..)
        .map(|(&(manufacturer, model, year, price), id)| Vehicle {
            id,
            manufacturer: manufacturer.to_string(),
            model: model.to_string(),
            year,
            price,
            highlighted: false,
        })
        .collect()
}

/// In-memory vehicle search with simulated latency and injectable failures
pub struct InMemoryVehicleApi {
    vehicles: Vec<Vehicle>,
    latency: Duration,
    failures: AtomicU32,
    calls: AtomicU32,
}

impl InMemoryVehicleApi {
    pub fn new(latency: Duration) -> Self {
        Self {
            vehicles: inventory(),
            latency,
            failures: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    /// Make the next `count` fetches fail with a 503
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Run a search without latency or failure injection
    pub fn search(&self, filters: &VehicleFilters, highlights: &Highlights) -> ApiResponse<Vehicle, VehicleStatistics> {
        let mut matched: Vec<Vehicle> = self
            .vehicles
            .iter()
            .filter(|v| {
                filters
                    .manufacturer
                    .as_deref()
                    .is_none_or(|m| v.manufacturer.eq_ignore_ascii_case(m))
            })
            .filter(|v| filters.models.is_empty() || filters.models.contains(&v.model))
            .filter(|v| filters.year_min.is_none_or(|y| v.year >= y))
            .filter(|v| filters.year_max.is_none_or(|y| v.year <= y))
            .cloned()
            .collect();

        if let Some(sort) = &filters.sort {
            match sort.by.as_str() {
                "price" => matched.sort_by_key(|v| v.price),
                "year" => matched.sort_by_key(|v| v.year),
                "model" => matched.sort_by(|a, b| a.model.cmp(&b.model)),
                _ => {}
            }
            if sort.order == SortOrder::Desc {
                matched.reverse();
            }
        }

        let mut statistics = VehicleStatistics::default();
        for vehicle in &matched {
            *statistics.by_manufacturer.entry(vehicle.manufacturer.clone()).or_default() += 1;
        }
        if !matched.is_empty() {
            statistics.average_price = matched.iter().map(|v| v.price).sum::<u64>() / matched.len() as u64;
        }

        let highlighted_models = highlights.get_list("model");
        let total = matched.len() as u64;
        let size = filters.size.max(1) as usize;
        let skip = (filters.page.max(1) as usize - 1) * size;
        let results = matched
            .into_iter()
            .skip(skip)
            .take(size)
            .map(|mut v| {
                v.highlighted = highlighted_models.contains(&v.model);
                v
            })
            .collect();

        ApiResponse {
            results,
            total,
            statistics: Some(statistics),
        }
    }
}

#[async_trait]
impl ApiAdapter<VehicleFilters, Vehicle, VehicleStatistics> for InMemoryVehicleApi {
    async fn fetch(
        &self,
        filters: &VehicleFilters,
        highlights: &Highlights,
    ) -> Result<ApiResponse<Vehicle, VehicleStatistics>, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(call, ?filters, "InMemoryVehicleApi::fetch: called");
        tokio::time::sleep(self.latency).await;

        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(FetchError::from_status(503, "simulated outage", None));
        }
        Ok(self.search(filters, highlights))
    }
}

/// Serves `manufacturers` as buckets and `models` as a string list
pub struct InMemoryOptionsSource {
    vehicles: Vec<Vehicle>,
}

impl Default for InMemoryOptionsSource {
    fn default() -> Self {
        Self { vehicles: inventory() }
    }
}

#[async_trait]
impl OptionsSource for InMemoryOptionsSource {
    async fn fetch_raw(&self, endpoint: &str) -> Result<Value, FetchError> {
        match endpoint {
            "manufacturers" => {
                let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
                for vehicle in &self.vehicles {
                    *counts.entry(vehicle.manufacturer.as_str()).or_default() += 1;
                }
                Ok(Value::Array(
                    counts
                        .into_iter()
                        .map(|(key, doc_count)| json!({"key": key, "doc_count": doc_count}))
                        .collect(),
                ))
            }
            "models" => Ok(json!(self.vehicles.iter().map(|v| v.model.as_str()).collect::<Vec<_>>())),
            other => Err(FetchError::from_status(404, format!("unknown endpoint '{}'", other), None)),
        }
    }
}

type VehicleState = ResourceState<VehicleFilters, Vehicle, VehicleStatistics>;
type VehicleOrchestrator = ResourceOrchestrator<VehicleFilters, Vehicle, VehicleStatistics>;

/// Upper bound for each step of the demo
const STEP_TIMEOUT: Duration = Duration::from_secs(30);

async fn wait_state<F: Data, D: Data, S: Data>(
    orchestrator: &ResourceOrchestrator<F, D, S>,
    what: &str,
    predicate: impl Fn(&ResourceState<F, D, S>) -> bool,
) -> Result<ResourceState<F, D, S>> {
    let mut rx = orchestrator.subscribe();
    let waited = tokio::time::timeout(STEP_TIMEOUT, async {
        rx.wait_for(|state| predicate(state)).await.map(|state| state.clone())
    })
    .await;
    match waited {
        Ok(Ok(state)) => Ok(state),
        Ok(Err(_)) => Err(eyre!("state stream closed while waiting for {}", what)),
        Err(_) => Err(eyre!("timed out waiting for {}", what)),
    }
}

fn settled_on(manufacturer: &str) -> impl Fn(&VehicleState) -> bool + '_ {
    move |state| !state.loading && state.total_results > 0 && state.filters.manufacturer.as_deref() == Some(manufacturer)
}

fn describe(state: &VehicleState) -> String {
    let models: Vec<&str> = state.results.iter().map(|v| v.model.as_str()).collect();
    format!(
        "page {} of {} result(s): {}",
        state.filters.page,
        state.total_results,
        models.join(", ")
    )
}

/// Run a primary window and one pop-out through a full session
///
/// Returns a transcript of what happened, one line per step.
pub async fn run(config: &Config) -> Result<Vec<String>> {
    info!("demo::run: called");
    let mut transcript = Vec::new();

    let api = Arc::new(InMemoryVehicleApi::new(Duration::from_millis(50)));
    api.fail_next(1);
    let nav = Arc::new(HistoryNavigator::from_query("?manufacturer=Ford&page=1&size=3"));
    let location = Arc::new(LocationState::new(nav.clone()));
    let coordinator = Arc::new(RequestCoordinator::new(config.requests.clone()));
    let mapper = Arc::new(VehicleUrlMapper);
    let primary = Arc::new(VehicleOrchestrator::primary(
        location.clone(),
        mapper.clone(),
        api.clone(),
        coordinator.clone(),
    ));
    let options = Arc::new(FilterOptionsCache::new(
        Arc::new(InMemoryOptionsSource::default()),
        coordinator.clone(),
    ));

    let manufacturers = options.get_options("manufacturers", FilterOption::from_buckets).await?;
    transcript.push(format!(
        "options: {}",
        manufacturers
            .iter()
            .map(|o| format!("{} ({})", o.label, o.count.unwrap_or_default()))
            .collect::<Vec<_>>()
            .join(", ")
    ));

    let state = wait_state(&primary, "initial results", settled_on("Ford")).await?;
    transcript.push(format!("primary {}: {}", location.read(), describe(&state)));

    let host = Arc::new(SimulatedWindowHost::new());
    let hub = ChannelHub::new(config.sync.replay_buffer);
    let manager = Arc::new(PopOutManager::new(
        host.clone(),
        hub.clone(),
        config.sync.clone(),
        config.window.clone(),
    ));
    let _bridge = PrimaryBridge::start(primary.clone(), manager.clone(), Some(options.clone()));

    if !manager.open("results", "table", None) {
        return Err(eyre!("pop-out window was blocked"));
    }
    transcript.push(format!("opened pop-out 'results' on channel {}", config.sync.channel_name("results")));

    let popout: PopOutContext<VehicleFilters, Vehicle, VehicleStatistics> =
        PopOutContext::start(&hub, &config.sync, "results", mapper.clone(), &LocationParams::new())?;
    let mirrored = wait_state(popout.orchestrator(), "pop-out snapshot", settled_on("Ford")).await?;
    transcript.push(format!("pop-out mirrored {}", describe(&mirrored)));

    popout
        .orchestrator()
        .update_filters(|f| f.manufacturer = Some("Tesla".to_string()))?;
    let state = wait_state(&primary, "forwarded filter change", settled_on("Tesla")).await?;
    transcript.push(format!("pop-out changed filters, primary now {}: {}", location.read(), describe(&state)));
    wait_state(popout.orchestrator(), "pop-out update", settled_on("Tesla")).await?;

    popout
        .orchestrator()
        .update_highlights(&ParamPatch::new().set("model", "Model Y"))?;
    let highlighted = wait_state(popout.orchestrator(), "highlights", |s| {
        !s.loading && s.results.iter().any(|v| v.highlighted)
    })
    .await?;
    let marked: Vec<&str> = highlighted
        .results
        .iter()
        .filter(|v| v.highlighted)
        .map(|v| v.model.as_str())
        .collect();
    transcript.push(format!("pop-out highlighted {}", marked.join(", ")));

    let mut closed = manager.closed();
    if let Some(window) = host.window(&config.sync.channel_name("results")) {
        window.user_close();
    }
    let panel = tokio::time::timeout(STEP_TIMEOUT, closed.recv())
        .await
        .map_err(|_| eyre!("closed window was never detected"))??;
    transcript.push(format!("detected pop-out '{}' closed by user", panel));
    popout.close();

    if let Some(previous) = nav.back() {
        location.observe_external(previous);
        let state = wait_state(&primary, "history back", |s| {
            settled_on("Tesla")(s) && s.highlights.is_empty()
        })
        .await?;
        transcript.push(format!("history back to {}: {}", location.read(), describe(&state)));
    }

    let metrics = coordinator.metrics();
    transcript.push(format!(
        "requests: {} started, {} producer calls, {} retries, {} cache hits, {} failures",
        metrics.requests_started, metrics.producer_calls, metrics.retries, metrics.cache_hits, metrics.failures
    ));
    primary.destroy();
    Ok(transcript)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn name() -> impl Strategy<Value = String> {
        "[A-Za-z][A-Za-z0-9 -]{0,11}"
    }

    fn filters() -> impl Strategy<Value = VehicleFilters> {
        (
            proptest::option::of(name()),
            proptest::collection::vec(name(), 0..4),
            proptest::option::of(1990i64..2030),
            proptest::option::of(1990i64..2030),
            1u32..50,
            1u32..100,
            proptest::option::of((name(), any::<bool>())),
        )
            .prop_map(|(manufacturer, models, year_min, year_max, page, size, sort)| VehicleFilters {
                manufacturer,
                models,
                year_min,
                year_max,
                page,
                size,
                sort: sort.map(|(by, desc)| Sort {
                    by,
                    order: if desc { SortOrder::Desc } else { SortOrder::Asc },
                }),
            })
    }

    proptest! {
        #[test]
        fn prop_mapper_round_trips(f in filters()) {
            let mapper = VehicleUrlMapper;
            prop_assert_eq!(mapper.from_params(&mapper.to_params(&f)), f);
        }
    }

    #[test]
    fn test_mapper_defaults_and_empty_values() {
        let mapper = VehicleUrlMapper;
        let filters = mapper.from_params(&LocationParams::from_query_string("?manufacturer=Ford&page=1"));
        assert_eq!(filters.manufacturer.as_deref(), Some("Ford"));
        assert_eq!(filters.page, 1);
        assert_eq!(filters.size, DEFAULT_PAGE_SIZE);

        let params = mapper.to_params(&VehicleFilters::default()).strip_empty();
        assert!(!params.contains_key("manufacturer"));
        assert!(!params.contains_key("models"));
        assert!(!params.contains_key("sortBy"));
    }

    #[test]
    fn test_search_filters_sorts_and_pages() {
        let api = InMemoryVehicleApi::new(Duration::ZERO);
        let filters = VehicleFilters {
            manufacturer: Some("ford".to_string()),
            size: 2,
            page: 2,
            sort: Some(Sort {
                by: "price".to_string(),
                order: SortOrder::Desc,
            }),
            ..Default::default()
        };
        let response = api.search(&filters, &Highlights::new());
        assert_eq!(response.total, 4);
        let models: Vec<&str> = response.results.iter().map(|v| v.model.as_str()).collect();
        assert_eq!(models, vec!["Explorer", "Mustang"]);
        let stats = response.statistics.unwrap();
        assert_eq!(stats.by_manufacturer.get("Ford"), Some(&4));
        assert_eq!(stats.average_price, 40_000);
    }

    #[test]
    fn test_search_marks_highlights() {
        let api = InMemoryVehicleApi::new(Duration::ZERO);
        let filters = VehicleFilters {
            manufacturer: Some("Tesla".to_string()),
            ..Default::default()
        };
        let response = api.search(&filters, &Highlights::new().with("model", "Model Y"));
        let marked: Vec<&str> = response
            .results
            .iter()
            .filter(|v| v.highlighted)
            .map(|v| v.model.as_str())
            .collect();
        assert_eq!(marked, vec!["Model Y"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_failure_is_retried_by_coordinator() {
        let api = Arc::new(InMemoryVehicleApi::new(Duration::from_millis(10)));
        api.fail_next(2);
        let coordinator = RequestCoordinator::default();
        let producer = {
            let api = api.clone();
            move || {
                let api = api.clone();
                async move { api.fetch(&VehicleFilters::default(), &Highlights::new()).await }
            }
        };
        let response = coordinator.execute("vehicles", producer).await.unwrap();
        assert_eq!(response.total, 12);
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test]
    async fn test_options_source() {
        let source = InMemoryOptionsSource::default();
        let raw = source.fetch_raw("manufacturers").await.unwrap();
        let options = FilterOption::from_buckets(&raw).unwrap();
        assert_eq!(options.len(), 4);
        assert!(source.fetch_raw("colors").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_demo_session_runs_to_completion() {
        let transcript = run(&Config::default()).await.unwrap();
        assert!(transcript.iter().any(|line| line.starts_with("pop-out mirrored")));
        assert!(transcript.iter().any(|line| line.contains("highlighted Model Y")));
        assert!(transcript.iter().any(|line| line.contains("closed by user")));
        assert!(transcript.last().unwrap().contains("1 retries"));
    }
}
