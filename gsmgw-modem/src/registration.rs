//! Network registration controller
//!
//! Brings the modem from power-on to a registered network:
//!
//! 1. Radio restart (`AT+COPS=2`, `AT+CFUN=0`, `AT+CFUN=1`), answering the
//!    SIM PIN request from the resulting notifications until `PB DONE`.
//! 2. Automatic registration restricted to the preferred technology
//!    (`AT+QCFG="nwscanmode"`, `AT+COPS=0`), polled with `AT+COPS?`.
//! 3. If that fails, a passive scan (`AT+COPS=?`) and manual registration
//!    against each reported operator, preferred technology first.
//!
//! The registration state is published through a watch channel; `Registered`
//! is the engine readiness signal.

use gsmgw_core::{
    AccessTechnology, ModemConfig, ModemError, ModemResult, NetworkCandidate, RegistrationState,
};
use gsmgw_session::Correlator;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Unlock is refused below this many remaining PIN attempts
pub const MIN_UNLOCK_ATTEMPTS: u32 = 3;

/// `AT+COPS?` polling rounds per registration attempt
pub const NETWORK_POLL_ATTEMPTS: usize = 10;

/// Delay before each `AT+COPS?` poll
pub const NETWORK_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Timeout of the passive `AT+COPS=?` scan
pub const PASSIVE_SCAN_TIMEOUT: Duration = Duration::from_secs(240);

/// Timeout of one manual registration attempt
pub const MANUAL_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Wait for each notification after the radio restart
pub const RESTART_NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(5);

/// `+COPS` short-form status meaning registration was rejected
pub const STATUS_REJECTED: u8 = 2;

static COPS_FULL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+COPS: (\d+),(\d+),(.*?),(\d+)").unwrap());
static COPS_SHORT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+COPS: (\d+)").unwrap());
static COPS_LIST: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+COPS: \((.*)\),,").unwrap());
static PIN_COUNTERS: Lazy<Regex> = Lazy::new(|| Regex::new(r#""SC",(\d+),(\d+)"#).unwrap());
static CSQ: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+CSQ: (\d+),(\d+)").unwrap());

/// Parsed `AT+COPS?` answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorStatus {
    /// `+COPS: <mode>,<format>,<oper>,<AcT>`
    Selected {
        mode: u8,
        operator: String,
        technology: Option<AccessTechnology>,
    },
    /// `+COPS: <mode>` without an operator
    Status(u8),
}

/// Parse an `AT+COPS?` response; None if it is not a `+COPS` answer
pub fn parse_operator_status(response: &str) -> Option<OperatorStatus> {
    if let Some(caps) = COPS_FULL.captures(response) {
        let act: u8 = caps[4].parse().ok()?;
        return Some(OperatorStatus::Selected {
            mode: caps[1].parse().ok()?,
            operator: caps[3].replace('"', ""),
            technology: AccessTechnology::from_act(act),
        });
    }

    let caps = COPS_SHORT.captures(response)?;
    Some(OperatorStatus::Status(caps[1].parse().ok()?))
}

/// Parse the `AT+COPS=?` operator list
///
/// Entries with an unknown technology are logged and skipped.
///
/// # Errors
/// Returns `ModemError::NetworkError` if the list, or any entry in it, is
/// malformed
pub fn parse_scan_list(response: &str) -> ModemResult<Vec<NetworkCandidate>> {
    let caps = COPS_LIST
        .captures(response)
        .ok_or_else(|| ModemError::NetworkError(format!("Bad network list: {:?}", response)))?;

    let mut candidates = Vec::new();
    for entry in caps[1].split("),(") {
        let fields: Vec<&str> = entry.split(',').collect();
        if fields.len() != 5 {
            return Err(ModemError::NetworkError(format!(
                "Bad network entry: {:?}",
                entry
            )));
        }

        let act: u8 = fields[4].trim().parse().map_err(|_| {
            ModemError::NetworkError(format!("Bad access technology in {:?}", entry))
        })?;
        let Some(technology) = AccessTechnology::from_act(act) else {
            log::warn!("Skipping network with unknown technology {}: {:?}", act, entry);
            continue;
        };

        candidates.push(NetworkCandidate {
            long_name: fields[1].replace('"', ""),
            short_name: fields[2].replace('"', ""),
            numeric: fields[3].replace('"', ""),
            technology,
        });
    }

    if candidates.is_empty() {
        return Err(ModemError::NetworkError(format!(
            "Empty network list: {:?}",
            response
        )));
    }
    Ok(candidates)
}

/// Parse `+QPINC: "SC",<left>,<total>` into (left, total)
///
/// # Errors
/// Returns `ModemError::RegistrationError` if the counters are missing
pub fn parse_pin_counters(response: &str) -> ModemResult<(u32, u32)> {
    let bad = || ModemError::RegistrationError(format!("Bad PIN counters: {:?}", response));
    let caps = PIN_COUNTERS.captures(response).ok_or_else(bad)?;
    let left = caps[1].parse().map_err(|_| bad())?;
    let total = caps[2].parse().map_err(|_| bad())?;
    Ok((left, total))
}

/// Parse `+CSQ: <rssi>,<ber>`
pub fn parse_signal_quality(response: &str) -> Option<(u8, u8)> {
    let caps = CSQ.captures(response)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

/// Technologies in the order manual registration tries them
///
/// The preferred technology first, then the rest by descending `<AcT>`.
pub fn try_order(preferred: AccessTechnology) -> Vec<AccessTechnology> {
    std::iter::once(preferred)
        .chain(AccessTechnology::ALL.into_iter().filter(|t| *t != preferred))
        .collect()
}

/// Manual registration plan built from a passive scan
///
/// Candidates are bucketed by technology and handed out one at a time in
/// scan-report order. Once a bucket runs dry it is dropped for good and the
/// technology preference is disregarded for every later attempt.
#[derive(Debug, Clone)]
pub struct CandidatePlan {
    order: VecDeque<AccessTechnology>,
    buckets: HashMap<AccessTechnology, VecDeque<NetworkCandidate>>,
    disregard_preference: bool,
}

impl CandidatePlan {
    pub fn new(preferred: AccessTechnology, candidates: Vec<NetworkCandidate>) -> Self {
        let mut buckets: HashMap<AccessTechnology, VecDeque<NetworkCandidate>> = HashMap::new();
        for candidate in candidates {
            buckets
                .entry(candidate.technology)
                .or_default()
                .push_back(candidate);
        }

        Self {
            order: try_order(preferred).into(),
            buckets,
            disregard_preference: false,
        }
    }

    /// Next candidate to try, or None once every bucket is exhausted
    pub fn next_candidate(&mut self) -> Option<NetworkCandidate> {
        while let Some(technology) = self.order.front().copied() {
            match self.buckets.get_mut(&technology).and_then(VecDeque::pop_front) {
                Some(candidate) => return Some(candidate),
                None => {
                    self.order.pop_front();
                    self.disregard_preference = true;
                }
            }
        }
        None
    }

    /// Whether registration on any technology counts as success
    pub fn disregard_preference(&self) -> bool {
        self.disregard_preference
    }
}

/// Awaitable view of the registration state
///
/// Other subsystems (e.g. a data-session supervisor) wait on it until the
/// engine is registered.
#[derive(Debug, Clone)]
pub struct ReadySignal {
    state: watch::Receiver<RegistrationState>,
}

impl ReadySignal {
    pub(crate) fn new(state: watch::Receiver<RegistrationState>) -> Self {
        Self { state }
    }

    /// Current registration state
    pub fn state(&self) -> RegistrationState {
        *self.state.borrow()
    }

    /// Check if the engine is registered
    pub fn is_ready(&self) -> bool {
        self.state() == RegistrationState::Registered
    }

    /// Wait until registration completes
    ///
    /// # Errors
    /// * `ModemError::NetworkError` if registration was rejected
    /// * `ModemError::RegistrationError` if the engine stopped first
    pub async fn wait_ready(&mut self) -> ModemResult<()> {
        let stopped =
            || ModemError::RegistrationError("Engine stopped before registration".to_string());
        let state = *self
            .state
            .wait_for(RegistrationState::is_terminal)
            .await
            .map_err(|_| stopped())?;

        match state {
            RegistrationState::Registered => Ok(()),
            RegistrationState::Stopped => Err(stopped()),
            other => Err(ModemError::NetworkError(format!(
                "Registration ended in state {}",
                other
            ))),
        }
    }
}

/// Drives SIM unlock and network selection
pub struct RegistrationController {
    correlator: Arc<Correlator>,
    sim_pin: Option<String>,
    preferred: AccessTechnology,
    apn: Option<String>,
    state: Arc<watch::Sender<RegistrationState>>,
    signal_quality: Option<u8>,
}

impl RegistrationController {
    pub fn new(
        correlator: Arc<Correlator>,
        config: &ModemConfig,
        state: Arc<watch::Sender<RegistrationState>>,
    ) -> Self {
        Self {
            correlator,
            sim_pin: config.sim_pin.clone(),
            preferred: config.preferred_network,
            apn: config.apn.clone(),
            state,
            signal_quality: None,
        }
    }

    fn set_state(&self, state: RegistrationState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::info!("Registration state: {} -> {}", previous, state);
        }
    }

    /// Last reported signal strength (`<rssi>` of `+CSQ`)
    pub fn signal_quality(&self) -> Option<u8> {
        self.signal_quality
    }

    /// Read the SIM PIN counters as (left, total)
    pub async fn unlock_attempts(&self) -> ModemResult<(u32, u32)> {
        let response = self.correlator.cmd("AT+QPINC?").await?;
        parse_pin_counters(&response)
    }

    /// Unlock the SIM with the configured PIN
    ///
    /// The remaining attempts are checked first: below
    /// [`MIN_UNLOCK_ATTEMPTS`] nothing is sent, whether or not a PIN is
    /// configured.
    ///
    /// # Errors
    /// * `ModemError::RegistrationError` if too few attempts remain or no PIN is configured
    /// * `ModemError::CommandError` if the modem rejected the PIN
    pub async fn sim_unlock(&self) -> ModemResult<()> {
        self.set_state(RegistrationState::PinLocked);

        let (left, total) = self.unlock_attempts().await?;
        if left < MIN_UNLOCK_ATTEMPTS {
            return Err(ModemError::RegistrationError(format!(
                "SIM unlock attempts below {} ({}/{})",
                MIN_UNLOCK_ATTEMPTS, left, total
            )));
        }

        let Some(pin) = &self.sim_pin else {
            return Err(ModemError::RegistrationError(
                "SIM unlock needed but no PIN setup".to_string(),
            ));
        };

        log::info!("Unlocking SIM ({}/{} attempts left)", left, total);
        self.correlator.cmd_ok(&format!("AT+CPIN={}", pin)).await?;
        self.set_state(RegistrationState::Unregistered);
        Ok(())
    }

    /// Restart the radio and wait for the SIM to come up
    ///
    /// Disables automatic registration, writes the APN if configured, cycles
    /// `AT+CFUN` and then consumes notifications until `PB DONE`, unlocking
    /// the SIM when it asks for its PIN.
    ///
    /// # Errors
    /// * `ModemError::TransportTimeout` if no notification arrives in time
    /// * any error of [`Self::sim_unlock`]
    pub async fn restart_radio(
        &self,
        notifications: &mut mpsc::UnboundedReceiver<String>,
    ) -> ModemResult<()> {
        self.correlator.cmd_ok("AT+COPS=2").await?;
        if let Some(apn) = &self.apn {
            self.correlator
                .cmd_ok(&format!("AT+CGDCONT=1,\"IPV4V6\",\"{}\"", apn))
                .await?;
        }
        self.correlator.cmd_ok("AT+CFUN=0").await?;
        self.correlator.cmd_ok("AT+CFUN=1").await?;

        loop {
            let urc = tokio::time::timeout(RESTART_NOTIFICATION_TIMEOUT, notifications.recv())
                .await
                .map_err(|_| ModemError::TransportTimeout)?
                .ok_or_else(|| {
                    ModemError::Connection(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "Notification queue closed",
                    ))
                })?;
            log::info!("URC -> {:?}", urc);

            if urc.contains("+CPIN: SIM PIN") {
                self.sim_unlock().await?;
            } else if urc.contains("PB DONE") {
                return Ok(());
            }
        }
    }

    /// Log the signal strength when it changes
    ///
    /// The reading is advisory; an unparsable answer is ignored.
    pub async fn measure_signal_quality(&mut self) -> ModemResult<()> {
        let response = self.correlator.cmd("AT+CSQ").await?;
        let Some((rssi, ber)) = parse_signal_quality(&response) else {
            log::debug!("Ignoring CSQ answer {:?}", response);
            return Ok(());
        };

        if self.signal_quality != Some(rssi) {
            log::info!(
                "CSQ changed! {} -> {} ({})",
                self.signal_quality.map_or("-".to_string(), |q| q.to_string()),
                rssi,
                ber
            );
            self.signal_quality = Some(rssi);
        }
        Ok(())
    }

    /// Poll `AT+COPS?` until the modem reports a usable registration
    ///
    /// Succeeds on the preferred technology, or on any technology when
    /// `disregard_preference` is set. A rejected status ends polling early.
    pub async fn wait_for_network(&mut self, disregard_preference: bool) -> ModemResult<bool> {
        for _ in 0..NETWORK_POLL_ATTEMPTS {
            tokio::time::sleep(NETWORK_POLL_INTERVAL).await;

            let response = self.correlator.cmd("AT+COPS?").await?;
            self.measure_signal_quality().await?;

            match parse_operator_status(&response) {
                None => log::warn!("AT+COPS bad output: {:?}", response),
                Some(OperatorStatus::Status(status)) => {
                    if status == STATUS_REJECTED {
                        log::warn!("AT+COPS got rejected status");
                        break;
                    }
                }
                Some(OperatorStatus::Selected {
                    mode,
                    operator,
                    technology,
                }) => {
                    log::info!(
                        "Network: {} ({}), status: {}",
                        operator,
                        technology.map_or("unknown", AccessTechnology::as_str),
                        mode
                    );
                    if disregard_preference || technology == Some(self.preferred) {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Register on a network
    ///
    /// # Errors
    /// Returns `ModemError::NetworkError` if neither automatic registration
    /// nor any scanned operator succeeded; the state is then `Rejected`.
    pub async fn select_network(&mut self) -> ModemResult<()> {
        self.correlator
            .cmd_ok(&format!(
                "AT+QCFG=\"nwscanmode\",{}",
                self.preferred.scan_mode()
            ))
            .await?;
        self.correlator.cmd_ok("AT+COPS=0").await?;

        log::info!("Waiting for network...");
        if self.wait_for_network(false).await? {
            log::info!("Auto-connected!");
            self.set_state(RegistrationState::Registered);
            return Ok(());
        }

        self.set_state(RegistrationState::Scanning);
        match self.manual_selection().await {
            Ok(()) => {
                self.set_state(RegistrationState::Registered);
                Ok(())
            }
            Err(e) => {
                if matches!(e, ModemError::NetworkError(_)) {
                    self.set_state(RegistrationState::Rejected);
                }
                Err(e)
            }
        }
    }

    async fn manual_selection(&mut self) -> ModemResult<()> {
        self.correlator.cmd_ok("AT+COPS=2").await?;
        log::warn!("Passive scanning available networks...");

        let response = self
            .correlator
            .issue("AT+COPS=?", PASSIVE_SCAN_TIMEOUT)
            .await?;
        let candidates = parse_scan_list(&response)?;

        log::info!("Available networks:");
        for candidate in &candidates {
            log::info!("    {}", candidate);
        }

        let mut plan = CandidatePlan::new(self.preferred, candidates);
        while let Some(candidate) = plan.next_candidate() {
            log::info!("Trying {} ({})", candidate.long_name, candidate.technology);

            let response = self
                .correlator
                .issue(
                    &format!(
                        "AT+COPS=1,0,\"{}\",{}",
                        candidate.long_name,
                        candidate.technology.act()
                    ),
                    MANUAL_REGISTRATION_TIMEOUT,
                )
                .await?;
            self.measure_signal_quality().await?;

            if response.contains("ERROR") {
                log::warn!("{} refused registration", candidate.long_name);
                continue;
            }

            if self.wait_for_network(plan.disregard_preference()).await? {
                log::info!("Finally! Connected.");
                return Ok(());
            }
        }

        Err(ModemError::NetworkError(
            "Failed connecting to all networks".to_string(),
        ))
    }
}
