//! Orchestrates one remote-to-remote copy.
//!
//! A bridge run is strictly sequential:
//!
//! 1. parse both endpoints (no network)
//! 2. resolve both aliases against ssh_config
//! 3. merge overrides for both sides, then settle credentials for both,
//!    prompting if needed
//! 4. open the source session, then the destination session
//! 5. stream the file
//! 6. close the destination and source sessions, whatever happened before
//!
//! Steps 1 to 3 are [`Bridge::prepare`], the rest is [`Bridge::execute`].
//! Every error leaving [`Bridge::run`] names the side and phase it came
//! from, except endpoint syntax errors which belong to neither side.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Serialize, Serializer};
use tokio_util::sync::CancellationToken;

use crate::auth::{
    AuthDecision, AuthNegotiator, FinalHost, Overrides, SecretPrompt, TerminalPrompt, merge,
};
use crate::config::HostConfigResolver;
use crate::endpoint::EndpointSpec;
use crate::error::{CleanupWarning, Error, ErrorKind, Phase, Result, Side, TransferError, UsageError};
use crate::transfer::{
    DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MAX_PIPELINE_DEPTH, Progress, Strategy, transfer_buffer,
    transfer_pipelined, transfer_stream,
};
use crate::transport::{
    Connector, DEFAULT_CONNECT_TIMEOUT, HostKeyVerification, RemoteSession, SshConfig, SshConnector,
};

/// Suffix of the temporary file written in atomic mode.
pub const PARTIAL_SUFFIX: &str = ".r2r-partial";

/// Settings for a bridge run. Build with [`BridgeBuilder`].
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Overrides for the source host.
    pub source: Overrides,

    /// Overrides for the destination host.
    pub destination: Overrides,

    /// How file data is moved.
    pub strategy: Strategy,

    /// Chunk size for streaming.
    pub chunk_size: usize,

    /// Chunks in flight when pipelining. `None` streams sequentially.
    pub pipeline_depth: Option<usize>,

    /// Bound on connecting and authenticating each side.
    pub timeout: Duration,

    /// Host key policy for both sides.
    pub host_key_verification: HostKeyVerification,

    /// known_hosts file, instead of `~/.ssh/known_hosts`.
    pub known_hosts_path: Option<PathBuf>,

    /// ssh_config file, instead of `~/.ssh/config`.
    pub ssh_config: Option<PathBuf>,

    /// Whether secrets may be prompted for.
    pub interactive: bool,

    /// Write to a temporary file and rename it into place on success.
    pub atomic: bool,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            source: Overrides::default(),
            destination: Overrides::default(),
            strategy: Strategy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            pipeline_depth: None,
            timeout: DEFAULT_CONNECT_TIMEOUT,
            host_key_verification: HostKeyVerification::default(),
            known_hosts_path: None,
            ssh_config: None,
            interactive: true,
            atomic: false,
        }
    }
}

/// Builder for [`BridgeOptions`].
///
/// # Example
///
/// ```rust,no_run
/// use r2r::BridgeBuilder;
///
/// # async fn example() -> Result<(), r2r::Error> {
/// let options = BridgeBuilder::new()
///     .source_username("deploy")
///     .destination_port(2222)
///     .atomic(true)
///     .build()?;
///
/// let result = r2r::bridge("build01:/out/app.tar", "web01:/srv/app.tar", options).await?;
/// println!("{} bytes", result.bytes_transferred);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct BridgeBuilder {
    options: BridgeOptions,
}

impl BridgeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source login name.
    pub fn source_username(mut self, username: impl Into<String>) -> Self {
        self.options.source.username = Some(username.into());
        self
    }

    /// Set the source port. 22 means "use ssh_config".
    pub fn source_port(mut self, port: u16) -> Self {
        self.options.source.port = port;
        self
    }

    /// Set the source private key.
    pub fn source_identity(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.source.identity_file = Some(path.into());
        self
    }

    /// Set the destination login name.
    pub fn destination_username(mut self, username: impl Into<String>) -> Self {
        self.options.destination.username = Some(username.into());
        self
    }

    /// Set the destination port. 22 means "use ssh_config".
    pub fn destination_port(mut self, port: u16) -> Self {
        self.options.destination.port = port;
        self
    }

    /// Set the destination private key.
    pub fn destination_identity(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.destination.identity_file = Some(path.into());
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.options.strategy = strategy;
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.options.chunk_size = chunk_size;
        self
    }

    /// Overlap reads and writes with up to `depth` chunks in flight.
    pub fn pipeline(mut self, depth: usize) -> Self {
        self.options.pipeline_depth = Some(depth);
        self
    }

    /// Set the connect and authentication timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn host_key_verification(mut self, policy: HostKeyVerification) -> Self {
        self.options.host_key_verification = policy;
        self
    }

    pub fn known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.known_hosts_path = Some(path.into());
        self
    }

    pub fn ssh_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.ssh_config = Some(path.into());
        self
    }

    /// Allow or forbid secret prompts (default: allowed).
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.options.interactive = interactive;
        self
    }

    pub fn atomic(mut self, atomic: bool) -> Self {
        self.options.atomic = atomic;
        self
    }

    /// Validate and return the options.
    pub fn build(self) -> Result<BridgeOptions> {
        let options = self.options;

        if options.chunk_size == 0 {
            return Err(conflict("chunk size must be greater than zero"));
        }
        if options.chunk_size > MAX_CHUNK_SIZE {
            return Err(conflict(&format!(
                "chunk size must be at most {MAX_CHUNK_SIZE} bytes"
            )));
        }
        match options.pipeline_depth {
            Some(0) => return Err(conflict("pipeline depth must be greater than zero")),
            Some(depth) if depth > MAX_PIPELINE_DEPTH => {
                return Err(conflict(&format!(
                    "pipeline depth must be at most {MAX_PIPELINE_DEPTH}"
                )));
            }
            Some(_) if options.strategy == Strategy::Buffer => {
                return Err(conflict("pipelining requires the stream strategy"));
            }
            _ => {}
        }

        Ok(options)
    }
}

fn conflict(message: &str) -> Error {
    UsageError::ConflictingOptions {
        message: message.to_string(),
    }
    .into()
}

/// Outcome of a successful bridge run.
#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    /// Source endpoint as given.
    pub source: String,

    /// Destination endpoint as given.
    pub destination: String,

    /// Bytes written to the destination.
    pub bytes_transferred: u64,

    /// Strategy used to move the data.
    pub strategy: Strategy,

    /// Wall time from start to both sessions closed.
    #[serde(rename = "elapsed_secs", serialize_with = "serialize_secs")]
    pub elapsed: Duration,

    /// Session teardown problems that did not affect the copy.
    pub cleanup_warnings: Vec<CleanupWarning>,
}

impl TransferResult {
    /// True when the copy completed and both sessions closed cleanly.
    pub fn is_success(&self) -> bool {
        self.cleanup_warnings.is_empty()
    }
}

fn serialize_secs<S: Serializer>(
    elapsed: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64())
}

/// Endpoints and credentials for one copy, ready to connect.
///
/// Produced by [`Bridge::prepare`] and consumed by [`Bridge::execute`].
#[derive(Debug)]
pub struct PreparedTransfer {
    source: EndpointSpec,
    destination: EndpointSpec,
    source_host: FinalHost,
    destination_host: FinalHost,
    source_auth: AuthDecision,
    destination_auth: AuthDecision,
}

impl PreparedTransfer {
    pub fn source(&self) -> &EndpointSpec {
        &self.source
    }

    pub fn destination(&self) -> &EndpointSpec {
        &self.destination
    }
}

/// Copies files between two remote hosts.
pub struct Bridge<C, P = TerminalPrompt> {
    connector: C,
    prompt: P,
    options: BridgeOptions,
    resolver: HostConfigResolver,
}

impl<C: Connector, P: SecretPrompt> Bridge<C, P> {
    pub fn new(connector: C, prompt: P, options: BridgeOptions) -> Self {
        let resolver = options
            .ssh_config
            .clone()
            .map(HostConfigResolver::with_path)
            .unwrap_or_default();

        Self {
            connector,
            prompt,
            options,
            resolver,
        }
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// Copy `source` (`alias:path`) to `destination` (`alias:path`).
    ///
    /// Runs [`Bridge::prepare`] then [`Bridge::execute`].
    pub async fn run<F>(
        &self,
        source: &str,
        destination: &str,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> Result<TransferResult>
    where
        F: FnMut(Progress),
    {
        let prepared = self.prepare(source, destination)?;
        self.execute(prepared, cancel, on_progress).await
    }

    /// Parse both endpoints, resolve both aliases and settle credentials
    /// for both sides. Touches no network.
    ///
    /// Both hosts are merged before any prompt is shown, so a missing
    /// username on either side fails without asking for a secret.
    pub fn prepare(&self, source: &str, destination: &str) -> Result<PreparedTransfer> {
        let src_spec = EndpointSpec::parse(source)?;
        let dst_spec = EndpointSpec::parse(destination)?;

        let src_resolved = self
            .resolver
            .resolve(src_spec.host_alias())
            .map_err(|e| Error::at(Side::Source, Phase::Resolve, e))?;
        let dst_resolved = self
            .resolver
            .resolve(dst_spec.host_alias())
            .map_err(|e| Error::at(Side::Destination, Phase::Resolve, e))?;

        let src_host = merge(&src_resolved, &self.options.source)
            .map_err(|e| negotiation_error(Side::Source, e))?;
        let dst_host = merge(&dst_resolved, &self.options.destination)
            .map_err(|e| negotiation_error(Side::Destination, e))?;

        let negotiator = AuthNegotiator::new(&self.prompt, self.options.interactive);
        let src_auth = negotiator
            .credentials(&src_host, &src_resolved, &self.options.source)
            .map_err(|e| negotiation_error(Side::Source, e))?;
        let dst_auth = negotiator
            .credentials(&dst_host, &dst_resolved, &self.options.destination)
            .map_err(|e| negotiation_error(Side::Destination, e))?;

        Ok(PreparedTransfer {
            source: src_spec,
            destination: dst_spec,
            source_host: src_host,
            destination_host: dst_host,
            source_auth: src_auth,
            destination_auth: dst_auth,
        })
    }

    /// Connect both sides and copy the file.
    ///
    /// `on_progress` is called after every chunk written when streaming.
    /// Cancellation is honoured while connecting as well as while copying.
    /// Both sessions are closed before this returns, on success and on
    /// every failure after the source connected.
    pub async fn execute<F>(
        &self,
        prepared: PreparedTransfer,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> Result<TransferResult>
    where
        F: FnMut(Progress),
    {
        let started = Instant::now();
        let PreparedTransfer {
            source: src_spec,
            destination: dst_spec,
            source_host: src_host,
            destination_host: dst_host,
            source_auth: src_auth,
            destination_auth: dst_auth,
        } = prepared;

        if cancel.is_cancelled() {
            return Err(cancelled_while_connecting(Side::Source));
        }

        debug!("opening source session to {}", src_host.target());
        let mut src_session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled_while_connecting(Side::Source)),
            session = self.connector.connect(self.ssh_config(src_host, src_auth)) => {
                session.map_err(|e| connect_error(Side::Source, e))?
            }
        };

        debug!("opening destination session to {}", dst_host.target());
        let dst_connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(cancelled_while_connecting(Side::Destination)),
            session = self.connector.connect(self.ssh_config(dst_host, dst_auth)) => {
                session.map_err(|e| connect_error(Side::Destination, e))
            }
        };
        let mut dst_session = match dst_connected {
            Ok(session) => session,
            Err(e) => {
                let mut warnings = Vec::new();
                close_session(&mut src_session, Side::Source, &mut warnings).await;
                return Err(e);
            }
        };

        let outcome = self
            .copy(
                &mut src_session,
                &mut dst_session,
                src_spec.remote_path(),
                dst_spec.remote_path(),
                cancel,
                on_progress,
            )
            .await;

        let mut warnings = Vec::new();
        close_session(&mut dst_session, Side::Destination, &mut warnings).await;
        close_session(&mut src_session, Side::Source, &mut warnings).await;

        let bytes_transferred = outcome?;
        let result = TransferResult {
            source: src_spec.to_string(),
            destination: dst_spec.to_string(),
            bytes_transferred,
            strategy: self.options.strategy,
            elapsed: started.elapsed(),
            cleanup_warnings: warnings,
        };

        info!(
            "transferred {} -> {} ({} bytes in {:.2?})",
            result.source, result.destination, result.bytes_transferred, result.elapsed
        );
        Ok(result)
    }

    /// Move the file between two open sessions.
    async fn copy<S, D, F>(
        &self,
        src: &mut S,
        dst: &mut D,
        src_path: &str,
        dst_path: &str,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> Result<u64>
    where
        S: RemoteSession,
        D: RemoteSession,
        F: FnMut(Progress),
    {
        let options = &self.options;

        let total = match options.strategy {
            Strategy::Stream => src
                .stat_size(src_path)
                .await
                .map_err(|e| Error::at(Side::Source, Phase::Transfer, e))?,
            Strategy::Buffer => 0,
        };

        let mut reader = src
            .open_read(src_path)
            .await
            .map_err(|e| Error::at(Side::Source, Phase::Transfer, e))?;

        let write_path = if options.atomic {
            format!("{dst_path}{PARTIAL_SUFFIX}")
        } else {
            dst_path.to_string()
        };
        let mut writer = dst
            .open_write(&write_path)
            .await
            .map_err(|e| Error::at(Side::Destination, Phase::Transfer, e))?;

        debug!(
            "copying {} bytes with {:?} strategy (chunk {}, pipeline {:?})",
            total, options.strategy, options.chunk_size, options.pipeline_depth
        );

        let copied = match (options.strategy, options.pipeline_depth) {
            (Strategy::Stream, None) => {
                transfer_stream(
                    &mut reader,
                    &mut writer,
                    total,
                    options.chunk_size,
                    cancel,
                    on_progress,
                )
                .await
            }
            (Strategy::Stream, Some(depth)) => {
                transfer_pipelined(
                    &mut reader,
                    &mut writer,
                    total,
                    options.chunk_size,
                    depth,
                    cancel,
                    on_progress,
                )
                .await
            }
            (Strategy::Buffer, _) => transfer_buffer(&mut reader, &mut writer, cancel).await,
        };
        drop(writer);
        drop(reader);

        let copied = match copied {
            Ok(copied) => copied,
            Err(e) => {
                if options.atomic {
                    discard_partial(dst, &write_path).await;
                }
                let e = e.with_paths(src_path, &write_path);
                return Err(Error::at(e.side(), Phase::Transfer, e));
            }
        };

        if options.atomic {
            if let Err(e) = commit_partial(dst, &write_path, dst_path).await {
                discard_partial(dst, &write_path).await;
                return Err(Error::at(Side::Destination, Phase::Transfer, e));
            }
        }

        Ok(copied)
    }

    fn ssh_config(&self, host: FinalHost, auth: AuthDecision) -> SshConfig {
        let mut config = SshConfig::new(host, auth);
        config.timeout = self.options.timeout;
        config.host_key_verification = self.options.host_key_verification;
        config.known_hosts_path = self.options.known_hosts_path.clone();
        config
    }
}

/// Copy `source` to `destination` over SSH, prompting on the terminal for
/// any secrets.
pub async fn bridge(source: &str, destination: &str, options: BridgeOptions) -> Result<TransferResult> {
    Bridge::new(SshConnector, TerminalPrompt, options)
        .run(source, destination, &CancellationToken::new(), |_| {})
        .await
}

fn negotiation_error(side: Side, error: Error) -> Error {
    let phase = match error.kind() {
        ErrorKind::Configuration => Phase::Resolve,
        _ => Phase::Auth,
    };
    Error::at(side, phase, error)
}

fn cancelled_while_connecting(side: Side) -> Error {
    Error::at(
        side,
        Phase::Connect,
        TransferError::Cancelled {
            bytes_transferred: 0,
        },
    )
}

fn connect_error(side: Side, error: Error) -> Error {
    let phase = match error.kind() {
        ErrorKind::Authentication => Phase::Auth,
        _ => Phase::Connect,
    };
    Error::at(side, phase, error)
}

async fn close_session<S: RemoteSession>(
    session: &mut S,
    side: Side,
    warnings: &mut Vec<CleanupWarning>,
) {
    if session.is_closed() {
        return;
    }
    if let Err(e) = session.close().await {
        let warning = CleanupWarning {
            side,
            message: e.to_string(),
        };
        warn!("{}", warning);
        warnings.push(warning);
    }
}

/// Rename the finished temporary file onto the destination path.
///
/// SFTP servers commonly refuse to rename over an existing file, so on
/// failure the old destination is removed and the rename retried once.
async fn commit_partial<D: RemoteSession>(
    dst: &mut D,
    partial: &str,
    target: &str,
) -> std::result::Result<(), TransferError> {
    match dst.rename(partial, target).await {
        Ok(()) => Ok(()),
        Err(first) => {
            debug!("rename onto {} failed ({}), replacing existing file", target, first);
            if dst.remove(target).await.is_err() {
                return Err(first);
            }
            dst.rename(partial, target).await
        }
    }
}

async fn discard_partial<D: RemoteSession>(dst: &mut D, partial: &str) {
    if let Err(e) = dst.remove(partial).await {
        warn!(
            "{}",
            CleanupWarning {
                side: Side::Destination,
                message: format!("failed to remove '{partial}': {e}"),
            }
        );
    }
}
