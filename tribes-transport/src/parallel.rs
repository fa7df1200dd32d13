use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, trace, warn};

use tribes_core::channel_data::ChannelData;
use tribes_core::error::{ChannelError, SendError};
use tribes_core::member::Member;

use crate::codec::create_data_package;
use crate::config::{SenderConfig, SocketOptions};
use crate::sender::{Channel, ConnectionState, NioSender};
use crate::state::SenderStateRegistry;

/// Delivers one message to many members at once, one cached connection per member.
#[derive(Debug)]
pub struct ParallelNioSender {
    options: SocketOptions,
    config: SenderConfig,
    senders: HashMap<Member, NioSender, ahash::RandomState>,
    states: Arc<SenderStateRegistry>,
    connected: bool,
    shutdown: Arc<AtomicBool>,
}

impl ParallelNioSender {
    pub fn new(
        options: SocketOptions,
        config: SenderConfig,
        states: Arc<SenderStateRegistry>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            options,
            config,
            senders: HashMap::default(),
            states,
            connected: false,
            shutdown,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn connect(&mut self) {
        self.connected = true;
    }

    pub fn disconnect(&mut self) {
        self.connected = false;
        for sender in self.senders.values_mut() {
            sender.disconnect();
        }
        self.senders.clear();
    }

    pub fn connection_state(&self, member: &Member) -> Option<ConnectionState> {
        self.senders.get(member).map(|sender| sender.state())
    }

    pub fn cached_connections(&self) -> usize {
        self.senders.len()
    }

    pub fn remove(&mut self, member: &Member) {
        if let Some(mut sender) = self.senders.remove(member) {
            sender.disconnect();
        }
    }

    /// Sends `data` to every destination, returning every faulty destination with its cause.
    pub async fn send_message(&mut self, destinations: &[Member], data: &ChannelData) -> Result<(), ChannelError> {
        if destinations.is_empty() {
            return Ok(());
        }
        let frame = data
            .to_bytes()
            .map_err(|error| error.to_string())
            .and_then(|payload| create_data_package(&payload).map_err(|error| error.to_string()))
            .map_err(|error| {
                ChannelError::with_all("unable to encode message", destinations, || SendError::Encode(error.clone()))
            })?;
        let udp = data.options.is_udp();
        let wait_for_ack = data.options.use_ack();
        let started = Instant::now();
        let mut error = ChannelError::new(format!("send to {} members failed", destinations.len()));
        let active = self.setup_for_send(destinations, frame.clone(), udp, &mut error);
        let completed = self.drive(&active, frame, wait_for_ack, started, &mut error).await;
        let timed_out = active
            .iter()
            .filter(|member| !completed.contains(*member) && !error.is_faulty(member))
            .cloned()
            .collect::<Vec<_>>();
        for member in timed_out {
            error.add_faulty_member(member, SendError::Timeout(self.config.timeout()));
        }
        if error.is_empty() {
            trace!("sent {} to {} members in {:?}", data.unique_id, destinations.len(), started.elapsed());
            Ok(())
        } else {
            for member in destinations.iter().filter(|member| completed.contains(*member)) {
                error.add_completed(member.clone());
            }
            debug!("{}", error);
            self.disconnect();
            Err(error)
        }
    }

    fn setup_for_send(
        &mut self,
        destinations: &[Member],
        frame: Bytes,
        udp: bool,
        error: &mut ChannelError,
    ) -> HashSet<Member, ahash::RandomState> {
        let mut active = HashSet::default();
        for member in destinations {
            let sender = self.senders.entry(member.clone()).or_insert_with(|| {
                NioSender::new(member.clone(), udp, self.options.clone(), self.config.clone())
            });
            sender.reset();
            sender.set_udp(udp);
            let prepared = sender.connect().and_then(|_| sender.set_message(frame.clone()));
            match prepared {
                Ok(()) => {
                    active.insert(member.clone());
                }
                Err(cause) => {
                    self.states.escalate(member);
                    sender.disconnect();
                    error.add_faulty_member(member.clone(), cause);
                }
            }
        }
        active
    }

    async fn drive(
        &mut self,
        active: &HashSet<Member, ahash::RandomState>,
        frame: Bytes,
        wait_for_ack: bool,
        started: Instant,
        error: &mut ChannelError,
    ) -> HashSet<Member, ahash::RandomState> {
        let mut completed = HashSet::default();
        let deadline = started + self.config.timeout();
        let retry_allowed = self.connected && !self.shutdown.load(Ordering::Acquire);
        let config = &self.config;
        let states = &self.states;
        let mut pending = self
            .senders
            .iter_mut()
            .filter(|(member, _)| active.contains(*member))
            .map(|(member, sender)| {
                let frame = frame.clone();
                async move {
                    let result = deliver(sender, frame, wait_for_ack, config, states, retry_allowed).await;
                    (member.clone(), result)
                }
            })
            .collect::<FuturesUnordered<_>>();
        let sleep = sleep_until(deadline);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some((member, Ok(()))) => {
                        completed.insert(member);
                    }
                    Some((member, Err(cause))) => {
                        error.add_faulty_member(member, cause);
                    }
                    None => break,
                },
                _ = &mut sleep => {
                    debug!("send timed out after {:?} with {} members pending", self.config.timeout(), pending.len());
                    break;
                }
            }
        }
        completed
    }

    /// Recycles expired connections and prunes the ones that fail a probe read.
    pub fn keepalive(&mut self) -> bool {
        let mut changed = false;
        self.senders.retain(|member, sender| {
            if sender.keepalive() {
                changed = true;
                return false;
            }
            if !sender.is_connected() {
                return true;
            }
            match sender.probe() {
                Ok(()) => true,
                Err(error) => {
                    debug!("dropping cached connection to {}: {}", member.name(), error);
                    sender.disconnect();
                    changed = true;
                    false
                }
            }
        });
        changed
    }
}

async fn deliver<C: Channel>(
    sender: &mut NioSender<C>,
    frame: Bytes,
    wait_for_ack: bool,
    config: &SenderConfig,
    states: &SenderStateRegistry,
    retry_allowed: bool,
) -> Result<(), SendError> {
    let mut failure: Option<SendError> = None;
    loop {
        let result = match failure.take() {
            Some(cause) => Err(cause),
            None => {
                let connecting = sender.state() == ConnectionState::Connecting;
                let wait = if connecting { sender.connect_timeout() } else { config.select_timeout() };
                match timeout(wait, sender.ready()).await {
                    Err(_) if connecting => {
                        sender.disconnect();
                        Err(SendError::Timeout(wait))
                    }
                    Err(_) => {
                        trace!("no readiness from {} within {:?}", sender.destination().name(), wait);
                        continue;
                    }
                    Ok(Ok(ready)) => sender.process(ready, wait_for_ack),
                    Ok(Err(error)) => {
                        sender.disconnect();
                        Err(SendError::Io(error))
                    }
                }
            }
        };
        match result {
            Ok(true) => {
                states.set_ready(sender.destination());
                return Ok(());
            }
            Ok(false) => {}
            Err(cause) => {
                states.escalate(sender.destination());
                let retry = retry_allowed
                    && sender.attempt() < config.max_retry_attempts
                    && cause.is_retryable(config.throw_on_failed_ack);
                if !retry {
                    return Err(cause);
                }
                warn!(
                    "send to {} failed, retrying attempt {} of {}: {}",
                    sender.destination().name(),
                    sender.attempt() + 1,
                    config.max_retry_attempts,
                    cause
                );
                sender.disconnect();
                sender.set_attempt(sender.attempt() + 1);
                if let Err(cause) = sender.connect().and_then(|_| sender.set_message(frame.clone())) {
                    failure = Some(cause);
                }
            }
        }
    }
}
