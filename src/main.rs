//! Live NBA Odds Logging Service
//!
//! Polls Bovada's public event feed on a fixed interval, extracts moneyline,
//! spread, score and clock data for every listed game, and appends one CSV
//! row per team per cycle to a day-stamped directory of per-game files.
//!
//! Two entry modes:
//! - live (default): loops against the live event feed until it drains
//! - pregame (PREGAME=true): a single pass against the pre-match feed with
//!   per-event error tolerance, then exits

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::US::Eastern;
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::fs::{create_dir_all, OpenOptions};
use std::io::Write;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

const LIVE_EVENTS_URL: &str = "https://www.bovada.lv/services/sports/event/v2/events/A/description/basketball/nba?marketFilterId=def&liveOnly=true&lang=en";
const PREGAME_EVENTS_URL: &str = "https://www.bovada.lv/services/sports/event/v2/events/A/description/basketball/nba?marketFilterId=def&preMatchOnly=true&lang=en";
const PLAYOFF_EVENTS_URL: &str = "https://www.bovada.lv/services/sports/event/v2/events/A/description/basketball/nba-playoffs?marketFilterId=def&liveOnly=true&lang=en";
const SCORES_URL: &str = "https://services.bovada.lv/services/sports/results/api/v1/scores";
const DEFAULT_OUTPUT_ROOT: &str = "game_logs";

/// Bovada event feed structure. The feed is undocumented and drifts, so every
/// wire type decodes leniently and extraction validates what it needs.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct EventGroup {
    pub events: Vec<Event>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub description: String,
    pub competitors: Vec<Competitor>,
    pub display_groups: Vec<DisplayGroup>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Competitor {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DisplayGroup {
    pub markets: Vec<Market>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Market {
    pub description: String,
    pub outcomes: Vec<Outcome>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Outcome {
    #[serde(rename = "type")]
    pub side_type: String,
    pub price: Price,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Price {
    pub american: String,
    pub handicap: Option<f64>,
}

/// Bovada scores feed structure (separate host from the event feed).
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ScoreResponse {
    pub clock: Option<GameClock>,
    pub latest_score: Option<LatestScore>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct GameClock {
    pub period_number: i64,
    pub relative_game_time_in_secs: i64,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LatestScore {
    pub home: i64,
    pub visitor: i64,
}

/// Clock and score state for one event, fetched fresh every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreSnapshot {
    pub period: i64,
    pub secs_remaining: i64,
    pub home_score: i64,
    pub away_score: i64,
}

/// One CSV row: a single team's view of one poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamRow {
    pub team: String,
    pub score: i64,
    pub secs_remaining: i64,
    pub period: i64,
    pub moneyline: i64,
    pub spread: Option<SpreadLeg>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpreadLeg {
    pub price: i64,
    pub handicap: f64,
    pub side: String,
}

impl TeamRow {
    pub fn to_fields(&self) -> Vec<String> {
        let mut fields = vec![
            self.team.clone(),
            self.score.to_string(),
            self.secs_remaining.to_string(),
            self.period.to_string(),
            self.moneyline.to_string(),
        ];
        if let Some(leg) = &self.spread {
            fields.push(leg.price.to_string());
            fields.push(leg.handicap.to_string());
            fields.push(leg.side.clone());
        }
        fields
    }
}

/// Extraction failures. In pregame mode these cause a per-event skip; in live
/// mode they abort the cycle and trigger the cooldown.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("event {0} is missing competitor entries")]
    MalformedEvent(String),

    #[error("score feed for event {0} has no clock or latestScore")]
    MissingScoreData(String),

    #[error("no {kind} market listed for {event}")]
    MissingMarket { kind: MarketKind, event: String },

    #[error("the {kind} market for {event} does not price both sides")]
    OneSidedMarket { kind: MarketKind, event: String },

    #[error("unparseable american odds {0:?}")]
    BadOdds(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketKind {
    Spread,
    Moneyline,
}

impl MarketKind {
    fn matches(self, description: &str) -> bool {
        match self {
            MarketKind::Spread => description.to_ascii_lowercase().contains("spread"),
            MarketKind::Moneyline => description.eq_ignore_ascii_case("moneyline"),
        }
    }

    /// Historical market positions in the feed, used only when the feed
    /// carries no market descriptions at all.
    fn legacy_slot(self) -> usize {
        match self {
            MarketKind::Spread => 0,
            MarketKind::Moneyline => 1,
        }
    }
}

impl fmt::Display for MarketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketKind::Spread => write!(f, "point spread"),
            MarketKind::Moneyline => write!(f, "moneyline"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Live,
    Pregame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Away,
    Home,
}

fn side_from_label(label: &str) -> Option<Side> {
    if label.eq_ignore_ascii_case("A") || label.eq_ignore_ascii_case("away") {
        Some(Side::Away)
    } else if label.eq_ignore_ascii_case("H") || label.eq_ignore_ascii_case("home") {
        Some(Side::Home)
    } else {
        None
    }
}

/// Normalize Bovada's american odds string. "EVEN" is the book's pick-em
/// sentinel and means +100; everything else must be a signed integer.
pub fn parse_american(raw: &str) -> Result<i64, ExtractError> {
    if raw == "EVEN" {
        return Ok(100);
    }
    raw.trim()
        .parse::<i64>()
        .map_err(|_| ExtractError::BadOdds(raw.to_string()))
}

/// Locate a market by its description instead of its historical position.
///
/// The feed populates markets unevenly as tip-off approaches, so positions
/// shift; matching on the description is the only stable handle. The legacy
/// slot is consulted only for feeds that carry no descriptions at all — a
/// described list that lacks the requested kind is a hard miss, never a
/// wrong-market read.
pub fn find_market(event: &Event, kind: MarketKind) -> Result<&Market, ExtractError> {
    let missing = || ExtractError::MissingMarket {
        kind,
        event: event.description.clone(),
    };

    let group = event.display_groups.first().ok_or_else(missing)?;

    if let Some(market) = group.markets.iter().find(|m| kind.matches(&m.description)) {
        return Ok(market);
    }

    if group.markets.iter().any(|m| !m.description.is_empty()) {
        return Err(missing());
    }

    group.markets.get(kind.legacy_slot()).ok_or_else(missing)
}

/// An event needs both competitor entries before anything else about it is
/// worth fetching or extracting.
pub fn check_competitors(event: &Event) -> Result<(), ExtractError> {
    if event.competitors.len() < 2 {
        return Err(ExtractError::MalformedEvent(event.description.clone()));
    }
    Ok(())
}

/// Build the away and home rows for one event from one score snapshot.
///
/// Moneyline outcomes are assigned to a side by their `type` label when the
/// feed provides one; unlabeled outcomes fall back to the feed's documented
/// ordering (even index = away, odd = home). Pregame mode additionally
/// requires a complete spread market; any gap there fails the whole event so
/// no partial row is ever written.
pub fn extract_rows(
    event: &Event,
    snapshot: &ScoreSnapshot,
    mode: Mode,
) -> Result<(TeamRow, TeamRow), ExtractError> {
    check_competitors(event)?;
    let home_team = event.competitors[0].name.clone();
    let away_team = event.competitors[1].name.clone();

    let moneyline = find_market(event, MarketKind::Moneyline)?;
    let mut away_odds = None;
    let mut home_odds = None;
    for (i, outcome) in moneyline.outcomes.iter().enumerate() {
        let price = parse_american(&outcome.price.american)?;
        match side_from_label(&outcome.side_type) {
            Some(Side::Away) => away_odds = Some(price),
            Some(Side::Home) => home_odds = Some(price),
            None if i % 2 == 0 => away_odds = Some(price),
            None => home_odds = Some(price),
        }
    }
    let one_sided = |kind| ExtractError::OneSidedMarket {
        kind,
        event: event.description.clone(),
    };
    let away_odds = away_odds.ok_or_else(|| one_sided(MarketKind::Moneyline))?;
    let home_odds = home_odds.ok_or_else(|| one_sided(MarketKind::Moneyline))?;

    let (away_spread, home_spread) = match mode {
        Mode::Live => (None, None),
        Mode::Pregame => {
            let spread = find_market(event, MarketKind::Spread)?;
            let mut legs: [Option<SpreadLeg>; 2] = [None, None];
            for (i, outcome) in spread.outcomes.iter().enumerate() {
                let slot = match side_from_label(&outcome.side_type) {
                    Some(Side::Away) => 0,
                    Some(Side::Home) => 1,
                    None => i % 2,
                };
                let handicap = outcome
                    .price
                    .handicap
                    .ok_or_else(|| one_sided(MarketKind::Spread))?;
                legs[slot] = Some(SpreadLeg {
                    price: parse_american(&outcome.price.american)?,
                    handicap,
                    side: outcome.side_type.clone(),
                });
            }
            let [away_leg, home_leg] = legs;
            (
                Some(away_leg.ok_or_else(|| one_sided(MarketKind::Spread))?),
                Some(home_leg.ok_or_else(|| one_sided(MarketKind::Spread))?),
            )
        }
    };

    let away = TeamRow {
        team: away_team,
        score: snapshot.away_score,
        secs_remaining: snapshot.secs_remaining,
        period: snapshot.period,
        moneyline: away_odds,
        spread: away_spread,
    };
    let home = TeamRow {
        team: home_team,
        score: snapshot.home_score,
        secs_remaining: snapshot.secs_remaining,
        period: snapshot.period,
        moneyline: home_odds,
        spread: home_spread,
    };
    Ok((away, home))
}

/// The US/Eastern calendar day, formatted the way the game directories are
/// named (e.g. "Nov-12-2020"). Games tip off on Eastern time, so a UTC date
/// would split late games across two directories.
pub fn eastern_day_stamp(now: DateTime<Utc>) -> String {
    now.with_timezone(&Eastern).format("%b-%d-%Y").to_string()
}

/// Configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub live_url: String,
    pub pregame_url: String,
    pub scores_url: String,
    pub output_root: PathBuf,
    pub poll_interval_seconds: u64,
    pub cooldown_seconds: u64,
    /// If true, run one pregame pass and exit (no polling loop)
    pub pregame: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let playoffs = env::var("PLAYOFFS")
            .unwrap_or_else(|_| "false".to_string())
            .to_lowercase()
            == "true";
        let live_url = env::var("EVENTS_URL").unwrap_or_else(|_| {
            if playoffs {
                PLAYOFF_EVENTS_URL.to_string()
            } else {
                LIVE_EVENTS_URL.to_string()
            }
        });

        Self {
            live_url,
            pregame_url: PREGAME_EVENTS_URL.to_string(),
            scores_url: SCORES_URL.to_string(),
            output_root: env::var("OUTPUT_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_OUTPUT_ROOT)),
            poll_interval_seconds: env::var("POLL_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .unwrap_or(15),
            cooldown_seconds: env::var("COOLDOWN_SECONDS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .unwrap_or(60),
            pregame: env::var("PREGAME")
                .unwrap_or_else(|_| "false".to_string())
                .to_lowercase()
                == "true",
        }
    }
}

/// Appends rows to per-game CSV files inside the day directory. No headers,
/// no locking: the caller is single-threaded.
pub struct CsvSink {
    dir: PathBuf,
}

impl CsvSink {
    pub fn new(dir: PathBuf) -> Result<Self> {
        create_dir_all(&dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn append(&self, filename: &str, fields: &[String]) -> Result<()> {
        let path = self.dir.join(filename);
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{}", fields.join(","))
            .with_context(|| format!("failed to append to {}", path.display()))?;
        Ok(())
    }
}

/// Outcome of a single poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The feed returned an empty payload; there is nothing left to log.
    Drained,
    /// Rows appended this cycle.
    Wrote(usize),
}

/// Odds logging service
pub struct OddsLoggerService {
    config: Config,
    http_client: reqwest::Client,
    score_limiter: RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
    sink: CsvSink,
}

impl OddsLoggerService {
    pub fn new(config: Config) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(5)
            .build()
            .context("Failed to create HTTP client")?;

        // The scores endpoint sees one request per event per cycle; cap it so
        // a long slate can't hammer the book.
        let score_limiter = RateLimiter::direct(Quota::per_minute(NonZeroU32::new(120).unwrap()));

        let day_dir = config.output_root.join(eastern_day_stamp(Utc::now()));
        let sink = CsvSink::new(day_dir)?;

        Ok(Self {
            config,
            http_client,
            score_limiter,
            sink,
        })
    }

    pub fn output_dir(&self) -> &Path {
        self.sink.dir()
    }

    /// Fetch the event-list payload. The feed wraps the real event list as
    /// the first element of an outer array. Returns the raw body alongside
    /// the decoded groups so failures later in the cycle can report the
    /// payload they were working from.
    async fn fetch_event_groups(&self, url: &str) -> Result<(Vec<EventGroup>, String)> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .context("Failed to fetch events payload")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read events payload")?;

        if !status.is_success() {
            return Err(anyhow!(
                "events endpoint error (status {}): {}",
                status,
                truncate_payload(&body)
            ));
        }

        let groups: Vec<EventGroup> = serde_json::from_str(&body).with_context(|| {
            format!(
                "Failed to decode events payload: {}",
                truncate_payload(&body)
            )
        })?;
        Ok((groups, body))
    }

    /// Fetch the clock and score for one event from the scores endpoint.
    async fn fetch_score(&self, event_id: &str) -> Result<ScoreSnapshot> {
        self.score_limiter.until_ready().await;

        let url = format!("{}/{}", self.config.scores_url, event_id);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch score feed for event {}", event_id))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("Failed to read score feed for event {}", event_id))?;

        if !status.is_success() {
            return Err(anyhow!(
                "score feed error for event {} (status {}): {}",
                event_id,
                status,
                truncate_payload(&body)
            ));
        }

        let parsed: ScoreResponse = serde_json::from_str(&body).with_context(|| {
            format!(
                "Failed to decode score feed for event {}: {}",
                event_id,
                truncate_payload(&body)
            )
        })?;

        let clock = parsed
            .clock
            .ok_or_else(|| ExtractError::MissingScoreData(event_id.to_string()))?;
        let score = parsed
            .latest_score
            .ok_or_else(|| ExtractError::MissingScoreData(event_id.to_string()))?;

        Ok(ScoreSnapshot {
            period: clock.period_number,
            secs_remaining: clock.relative_game_time_in_secs,
            home_score: score.home,
            away_score: score.visitor,
        })
    }

    /// Fetch the score snapshot, extract both rows and append them.
    /// Returns the number of rows written.
    async fn log_event(&self, event: &Event, mode: Mode) -> Result<usize> {
        // Reject events with no usable competitors before spending a scores
        // request on them.
        check_competitors(event)?;
        let snapshot = self.fetch_score(&event.id).await?;
        let (away, home) = extract_rows(event, &snapshot, mode)?;

        info!(
            "{}: {} {} - {} {} (period {}, {}s left)",
            event.description,
            away.team,
            away.score,
            home.score,
            home.team,
            snapshot.period,
            snapshot.secs_remaining
        );

        let filename = format!("{}.csv", event.description);
        self.sink.append(&filename, &away.to_fields())?;
        self.sink.append(&filename, &home.to_fields())?;
        Ok(2)
    }

    /// Run every event through extraction. Pregame mode tolerates per-event
    /// failures (markets fill in unevenly before tip-off); live mode treats
    /// any failure as schema drift and lets the loop's cooldown handle it.
    async fn process_events(&self, events: &[Event], mode: Mode) -> Result<usize> {
        let mut rows_written = 0;
        for event in events {
            match self.log_event(event, mode).await {
                Ok(rows) => rows_written += rows,
                Err(e) if mode == Mode::Pregame => {
                    warn!("Skipping {}: {:#}", event.description, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(rows_written)
    }

    /// Single poll iteration against the feed for the given mode.
    pub async fn poll_once(&self, mode: Mode) -> Result<PollOutcome> {
        let url = match mode {
            Mode::Live => &self.config.live_url,
            Mode::Pregame => &self.config.pregame_url,
        };

        let (groups, payload) = self.fetch_event_groups(url).await?;
        let group = match groups.first() {
            Some(group) => group,
            None => return Ok(PollOutcome::Drained),
        };

        info!("Fetched {} events", group.events.len());
        let rows = self
            .process_events(&group.events, mode)
            .await
            .with_context(|| format!("cycle aborted; payload was: {}", truncate_payload(&payload)))?;
        Ok(PollOutcome::Wrote(rows))
    }

    /// Main polling loop. Runs until the feed drains. Failed cycles are
    /// counted, logged and retried after the cooldown; nothing is fatal here.
    pub async fn run(&self) -> Result<()> {
        info!(
            "Starting live odds loop (poll interval: {}s)",
            self.config.poll_interval_seconds
        );

        let mut consecutive_failures: u32 = 0;
        loop {
            let start = std::time::Instant::now();

            match self.poll_once(Mode::Live).await {
                Ok(PollOutcome::Drained) => {
                    info!("Event feed is empty, done logging");
                    return Ok(());
                }
                Ok(PollOutcome::Wrote(rows)) => {
                    consecutive_failures = 0;
                    info!("Poll completed: {} rows in {:?}", rows, start.elapsed());
                    tokio::time::sleep(Duration::from_secs(self.config.poll_interval_seconds))
                        .await;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!("Poll failed ({} consecutive): {:?}", consecutive_failures, e);
                    tokio::time::sleep(Duration::from_secs(self.config.cooldown_seconds)).await;
                }
            }
        }
    }
}

fn truncate_payload(body: &str) -> String {
    if body.chars().count() > 512 {
        let head: String = body.chars().take(512).collect();
        format!("{}...", head)
    } else {
        body.to_string()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("odds_logger=info".parse().unwrap()),
        )
        .init();

    info!("NBA Odds Logging Service");

    let config = Config::from_env();
    let pregame = config.pregame;

    let service = OddsLoggerService::new(config)?;
    info!("Writing game logs to {}", service.output_dir().display());

    if pregame {
        info!("Running one pregame pass (PREGAME=true)");
        match service.poll_once(Mode::Pregame).await {
            Ok(PollOutcome::Drained) => info!("No pregame events listed"),
            Ok(PollOutcome::Wrote(rows)) => info!("Pregame pass completed: {} rows", rows),
            Err(e) => {
                error!("Pregame pass failed: {:?}", e);
                return Err(e);
            }
        }
        return Ok(());
    }

    // Handle shutdown gracefully (continuous mode)
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        result = service.run() => {
            if let Err(e) = result {
                error!("Service error: {:?}", e);
            }
        }
        _ = ctrl_c => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
