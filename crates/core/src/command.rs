//! Operator command surface.
//!
//! Line-oriented commands from stdin. Read-only commands are repeated on
//! a blank line; action commands are not. The publish/subscribe commands
//! install reflex listeners on the event bus: a subscribe answers its
//! first discovery result with a follow-up, and both sides retire the
//! service once the expected reply arrives.

use tracing::{debug, info, warn};

use crate::election::same_rank_issuer;
use crate::engine::{Io, Outbox};
use crate::event::{EventKind, ServiceEvent, SubscriptionId};
use crate::service::{PublishType, ServiceKind, SubscribeType};
use crate::state::NanState;
use crate::time::{usec_to_tu, Clock, DW_INTERVAL_TU};
use crate::tx;

/// Payload of the automatic follow-up reply.
const REFLEX_REPLY: &[u8] = b"Hello world!";
/// Default payload of `peer … ping`.
const PING_PAYLOAD: &str = "#0000ff";
/// Service name used by `peer … ping`.
const PING_SERVICE: &str = "servicename";

enum ReflexAction {
    /// On a discovery result: send one follow-up, then listen for the
    /// reply.
    ReplyThenListen,
    /// On a receive: retire the service and the listener.
    CancelOnReceive,
}

struct Reflex {
    subscription: SubscriptionId,
    receiver: flume::Receiver<ServiceEvent>,
    action: ReflexAction,
}

/// Command-layer state carried between input lines.
pub struct CommandState {
    last_command: Option<String>,
    reflexes: Vec<Reflex>,
}

impl CommandState {
    pub fn new() -> Self {
        Self {
            last_command: None,
            reflexes: Vec::new(),
        }
    }
}

impl Default for CommandState {
    fn default() -> Self {
        Self::new()
    }
}

/// Process one input line.
pub fn handle_line<C: Clock>(
    state: &mut NanState,
    commands: &mut CommandState,
    outbox: &mut Outbox,
    clock: &C,
    line: &str,
) {
    let line = line.trim();
    let repeated;
    let line = if line.is_empty() {
        match &commands.last_command {
            Some(last) => {
                repeated = last.clone();
                repeated.as_str()
            }
            None => return,
        }
    } else {
        line
    };

    let mut parts = line.splitn(2, ' ');
    let cmd = parts.next().unwrap_or("");
    let args = parts.next().unwrap_or("").trim();

    let mut store_last = true;
    match cmd {
        "help" => print_help(),
        "device" => print_device_info(state),
        "sync" => print_sync_info(state, clock.now_usec()),
        "peers" => print_peers_info(state, clock.now_usec()),
        "services" => print_services_info(state, args),
        _ => {
            store_last = false;
            match cmd {
                "v+" => outbox.push(Io::AdjustVerbosity(1)),
                "v-" => outbox.push(Io::AdjustVerbosity(-1)),
                "publish" => publish_service(state, commands, args),
                "subscribe" => subscribe_service(state, commands, args),
                "set" => set_value(state, args),
                "peer" => peer_command(state, commands, args),
                _ => {
                    warn!(target: "nan::cmd", "unknown command: {}", line);
                    commands.last_command = None;
                    return;
                }
            }
        }
    }

    if store_last {
        commands.last_command = Some(line.to_owned());
    } else {
        commands.last_command = None;
    }
}

/// Drain pending reflex events and apply their actions. Called after
/// every callback that may have dispatched events.
pub fn run_reflexes(state: &mut NanState, commands: &mut CommandState) {
    loop {
        let mut hit = None;
        for (index, reflex) in commands.reflexes.iter().enumerate() {
            if let Ok(event) = reflex.receiver.try_recv() {
                hit = Some((index, event));
                break;
            }
        }
        let Some((index, event)) = hit else {
            break;
        };
        let reflex = commands.reflexes.remove(index);
        state.events.unsubscribe(reflex.subscription);

        match reflex.action {
            ReflexAction::ReplyThenListen => {
                let ServiceEvent::DiscoveryResult {
                    subscribe_id,
                    publish_id,
                    address,
                    ..
                } = event
                else {
                    continue;
                };
                let Some(service) = state.services.get(subscribe_id) else {
                    warn!(
                        target: "nan::cmd",
                        "discovery result for unknown service: {}", subscribe_id
                    );
                    continue;
                };
                let name = service.service_name.clone();
                debug!(
                    target: "nan::cmd",
                    "received discovery result from {} for {}", address, name
                );

                if tx::transmit(state, &address, subscribe_id, publish_id, REFLEX_REPLY).is_err() {
                    warn!(target: "nan::cmd", "could not transmit data to service {}", name);
                }
                install_reflex(
                    state,
                    commands,
                    EventKind::Receive,
                    &name,
                    ReflexAction::CancelOnReceive,
                );
            }
            ReflexAction::CancelOnReceive => {
                let ServiceEvent::Receive {
                    instance_id,
                    address,
                    service_info,
                    ..
                } = event
                else {
                    continue;
                };
                let Some(service) = state.services.get(instance_id) else {
                    warn!(
                        target: "nan::cmd",
                        "receive event for unknown service: {}", instance_id
                    );
                    continue;
                };
                debug!(
                    target: "nan::cmd",
                    "received response from {} for {}: {}",
                    address,
                    service.service_name,
                    String::from_utf8_lossy(&service_info)
                );

                let result = if service.is_published() {
                    state.services.cancel_publish(instance_id)
                } else {
                    state.services.cancel_subscribe(instance_id)
                };
                if result.is_err() {
                    warn!(target: "nan::cmd", "could not retire service {}", instance_id);
                }
            }
        }
    }
}

fn install_reflex(
    state: &mut NanState,
    commands: &mut CommandState,
    kind: EventKind,
    service_name: &str,
    action: ReflexAction,
) {
    let (subscription, receiver) = state.events.subscribe(kind, Some(service_name.to_owned()));
    commands.reflexes.push(Reflex {
        subscription,
        receiver,
        action,
    });
}

fn publish_service(state: &mut NanState, commands: &mut CommandState, args: &str) {
    let mut parts = args.splitn(2, ' ');
    let Some(service_name) = parts.next().filter(|s| !s.is_empty()) else {
        warn!(target: "nan::cmd", "usage: publish NAME [INFO]");
        return;
    };
    let service_info = parts.next().unwrap_or("");

    match state
        .services
        .publish(service_name, PublishType::Both, -1, service_info.as_bytes())
    {
        Ok(publish_id) => {
            install_reflex(
                state,
                commands,
                EventKind::Receive,
                service_name,
                ReflexAction::CancelOnReceive,
            );
            info!(
                target: "nan::cmd",
                "published service '{}' with data '{}' ({})",
                service_name, service_info, publish_id
            );
        }
        Err(_) => {
            warn!(
                target: "nan::cmd",
                "service with name {} already registered", service_name
            );
        }
    }
}

fn subscribe_service(state: &mut NanState, commands: &mut CommandState, args: &str) {
    let Some(service_name) = args.split(' ').next().filter(|s| !s.is_empty()) else {
        warn!(target: "nan::cmd", "usage: subscribe NAME");
        return;
    };

    match state
        .services
        .subscribe(service_name, SubscribeType::Passive, -1, b"")
    {
        Ok(subscribe_id) => {
            install_reflex(
                state,
                commands,
                EventKind::DiscoveryResult,
                service_name,
                ReflexAction::ReplyThenListen,
            );
            info!(
                target: "nan::cmd",
                "subscribed for service '{}' ({})", service_name, subscribe_id
            );
        }
        Err(_) => {
            warn!(
                target: "nan::cmd",
                "service with name {} already registered", service_name
            );
        }
    }
}

fn parse_u8(value: &str) -> Option<u8> {
    match value.parse::<u8>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(target: "nan::cmd", "expected value between 0 and 255, got '{}'", value);
            None
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "0" => Some(false),
        "1" => Some(true),
        _ => {
            warn!(target: "nan::cmd", "expected 0 or 1, got '{}'", value);
            None
        }
    }
}

fn set_value(state: &mut NanState, args: &str) {
    let mut parts = args.split(' ');
    let (Some(target), Some(value)) = (parts.next(), parts.next()) else {
        warn!(target: "nan::cmd", "usage: set TARGET VALUE");
        return;
    };

    match target {
        "mp" => {
            let Some(parsed) = parse_u8(value) else { return };
            state.sync.master_preference = parsed;
            let interface_address = state.interface_address;
            state.sync.update_master_rank(Some(&interface_address));
        }
        "rf" => {
            let Some(parsed) = parse_u8(value) else { return };
            state.sync.random_factor = parsed;
            let interface_address = state.interface_address;
            state.sync.update_master_rank(Some(&interface_address));
        }
        "desync" => {
            let Some(enable) = parse_flag(value) else { return };
            if enable {
                if state.peers.len() < 2 {
                    warn!(
                        target: "nan::cmd",
                        "cannot enable desync with less than 2 known peers"
                    );
                    return;
                }
                let dissenter = state
                    .peers
                    .iter()
                    .find(|peer| {
                        !same_rank_issuer(
                            state.sync.anchor_master_rank,
                            peer.anchor_master_rank,
                        )
                    })
                    .map(|peer| peer.addr);
                if let Some(addr) = dissenter {
                    warn!(
                        target: "nan::cmd",
                        "cannot enable desync: peer {} does not acknowledge us as anchor master",
                        addr
                    );
                    return;
                }
            }

            let base = state.timer.base_time_usec();
            for peer in state.peers.iter_mut() {
                peer.timer.set_base_time_usec(base);
                peer.old_timer.set_base_time_usec(base);
            }
            state.desync.enabled = enable;
            info!(
                target: "nan::cmd",
                "{} desync", if enable { "enabled" } else { "disabled" }
            );
        }
        _ => {
            warn!(target: "nan::cmd", "unknown target for 'set' command: {}", target);
            return;
        }
    }

    info!(target: "nan::cmd", "set {} to {}", target, value);
}

fn peer_command(state: &mut NanState, commands: &mut CommandState, args: &str) {
    let mut parts = args.splitn(3, ' ');
    let (Some(address_arg), Some(cmd)) = (parts.next(), parts.next()) else {
        warn!(target: "nan::cmd", "invalid arguments");
        return;
    };
    let cmd_args = parts.next().unwrap_or("").trim();

    let Some(addr) = state.peers.find_by_prefix(address_arg).map(|p| p.addr) else {
        warn!(
            target: "nan::cmd",
            "could not find peer by address matching: {}", address_arg
        );
        return;
    };

    match cmd {
        "set" => {
            let mut parts = cmd_args.split(' ');
            let Some(field) = parts.next().filter(|s| !s.is_empty()) else {
                warn!(target: "nan::cmd", "usage: peer ADDR set FIELD [VALUE]");
                return;
            };
            let value = parts.next();
            match field {
                "timer" => {
                    // Without a value, shift by the configured offset.
                    let offset_tu = match value {
                        Some(value) => match value.parse::<i64>() {
                            Ok(parsed) => parsed,
                            Err(_) => {
                                warn!(target: "nan::cmd", "not a number: '{}'", value);
                                return;
                            }
                        },
                        None => state.config.desync.offset_tu,
                    };
                    let max_send_old_count = state.config.desync.max_send_old_count;
                    let peer = state.peers.get_mut(&addr).expect("peer matched above");
                    let base = peer.timer.base_time_usec();
                    peer.old_timer.set_base_time_usec(base);
                    peer.timer.shift_base_time_tu(offset_tu);
                    // The shadow schedule stays covered for the
                    // configured number of transmissions.
                    if peer.max_send_old_count == 0 {
                        peer.max_send_old_count = max_send_old_count;
                    }
                    peer.old_timer_send_count = 0;
                    peer.total_timer_shift_tu += offset_tu;
                    info!(
                        target: "nan::cmd",
                        "shifted timer of peer {} for {} tu", addr, offset_tu
                    );
                }
                "counter" => {
                    let Some(Ok(count)) = value.map(|v| v.parse::<u32>()) else {
                        warn!(target: "nan::cmd", "usage: peer ADDR set counter NUMBER");
                        return;
                    };
                    let peer = state.peers.get_mut(&addr).expect("peer matched above");
                    peer.max_send_old_count = count;
                    peer.old_timer_send_count = 0;
                    info!(
                        target: "nan::cmd",
                        "set transmission counter of peer {} to {}", addr, count
                    );
                }
                _ => {
                    warn!(target: "nan::cmd", "unknown peer field: {}", field);
                }
            }
        }
        "rm" => {
            state.peers.remove(&addr);
            info!(target: "nan::cmd", "removed peer {}", addr);
        }
        "ping" => {
            let message = if cmd_args.is_empty() { PING_PAYLOAD } else { cmd_args };
            match state.services.publish(
                PING_SERVICE,
                PublishType::Unsolicited,
                -1,
                message.as_bytes(),
            ) {
                Ok(_) => {
                    install_reflex(
                        state,
                        commands,
                        EventKind::Receive,
                        PING_SERVICE,
                        ReflexAction::CancelOnReceive,
                    );
                    info!(target: "nan::cmd", "ping peer {}", addr);
                }
                Err(_) => {
                    warn!(target: "nan::cmd", "ping already in flight");
                }
            }
        }
        "forward" => {
            let Some(enable) = parse_flag(cmd_args) else { return };
            state.peers.get_mut(&addr).expect("peer matched above").forward = enable;
            info!(
                target: "nan::cmd",
                "{} forward for peer {}",
                if enable { "enabled" } else { "disabled" },
                addr
            );
        }
        "modify" => {
            let Some(enable) = parse_flag(cmd_args) else { return };
            state.peers.get_mut(&addr).expect("peer matched above").modify = enable;
            info!(
                target: "nan::cmd",
                "{} modify for peer {}",
                if enable { "enabled" } else { "disabled" },
                addr
            );
        }
        _ => {
            warn!(target: "nan::cmd", "unknown peer command: {}", cmd);
        }
    }
}

fn print_help() {
    info!(target: "nan::cmd", "available commands");
    info!(target: "nan::cmd", "--------------------------------------------------------------------");
    info!(target: "nan::cmd", " * help                                  prints this message");
    info!(target: "nan::cmd", "");
    info!(target: "nan::cmd", "info");
    info!(target: "nan::cmd", " * device                                prints current device state");
    info!(target: "nan::cmd", " * sync                                  prints current sync state");
    info!(target: "nan::cmd", " * peers                                 prints list of added peers");
    info!(target: "nan::cmd", " * services [pub, sub]                   prints published and/or subscribed services");
    info!(target: "nan::cmd", "");
    info!(target: "nan::cmd", "action");
    info!(target: "nan::cmd", " * publish NAME [INFO]                   publish a service with the given name");
    info!(target: "nan::cmd", " * subscribe NAME                        subscribe for a service with the given name");
    info!(target: "nan::cmd", " * set mp NUMBER                         set the master preference");
    info!(target: "nan::cmd", " * set rf NUMBER                         set the random factor");
    info!(target: "nan::cmd", " * set desync 0|1                        toggle the clock-shift experiment");
    info!(target: "nan::cmd", "");
    info!(target: "nan::cmd", "peer action");
    info!(target: "nan::cmd", " * peer ADDR set timer TU                shift the timer value of a peer");
    info!(target: "nan::cmd", " * peer ADDR set counter NUMBER          set the old-schedule transmission counter");
    info!(target: "nan::cmd", " * peer ADDR rm                          remove peer");
    info!(target: "nan::cmd", " * peer ADDR ping [MSG]                  publish a probe service toward a peer");
    info!(target: "nan::cmd", " * peer ADDR forward 0|1                 relay the peer's service frames");
    info!(target: "nan::cmd", " * peer ADDR modify 0|1                  rewrite relayed service payloads");
    info!(target: "nan::cmd", "");
    info!(target: "nan::cmd", "misc");
    info!(target: "nan::cmd", " * v+                                    increase log verbosity");
    info!(target: "nan::cmd", " * v-                                    decrease log verbosity");
    info!(target: "nan::cmd", "--------------------------------------------------------------------");
    info!(target: "nan::cmd", "submit empty line to redo last command (not supported for actions)");
}

fn print_device_info(state: &NanState) {
    info!(target: "nan::cmd", "device info");
    info!(target: "nan::cmd", "---------------------------------------------");
    info!(target: "nan::cmd", "hostname                 {}", state.hostname);
    info!(target: "nan::cmd", "interface address        {}", state.self_address);
    info!(target: "nan::cmd", "cluster id               {}", state.cluster.cluster_id);
}

fn print_sync_info(state: &NanState, now_usec: u64) {
    let synced_time_usec = state.timer.synced_time_usec(now_usec);
    let synced_time_tu = state.timer.synced_time_tu(now_usec);
    let next_dw_usec = state.timer.next_dw_usec(now_usec);

    info!(target: "nan::cmd", "sync");
    info!(target: "nan::cmd", "---------------------------------------------");
    info!(target: "nan::cmd", "current time (usec)      {}", now_usec);
    info!(target: "nan::cmd", "synced time (usec)       {}", synced_time_usec);
    info!(target: "nan::cmd", "synced time (tu)         {}", synced_time_tu);
    info!(target: "nan::cmd", "next dw (usec)           {}", next_dw_usec);
    info!(target: "nan::cmd", "next dw (tu)             {}", usec_to_tu(next_dw_usec));
    info!(target: "nan::cmd", "");
    info!(target: "nan::cmd", "role                     {}", state.sync.role.as_str());
    info!(target: "nan::cmd", "master rank              {}", state.sync.master_rank);
    info!(target: "nan::cmd", "master preference        {}", state.sync.master_preference);
    info!(target: "nan::cmd", "random factor            {}", state.sync.random_factor);
    info!(target: "nan::cmd", "");
    info!(target: "nan::cmd", "anchor master address    {}", state.sync.anchor_master_address());
    info!(target: "nan::cmd", "anchor master rank       {}", state.sync.anchor_master_rank);
    info!(target: "nan::cmd", "ambtt                    {}", state.sync.ambtt);
    info!(target: "nan::cmd", "hop count                {}", state.sync.hop_count);
    info!(target: "nan::cmd", "");
    info!(target: "nan::cmd", "last anchor master rank  {}", state.sync.last_anchor_master_rank);
    info!(target: "nan::cmd", "last ambtt               {}", state.sync.last_ambtt);
}

fn print_peers_info(state: &NanState, now_usec: u64) {
    info!(target: "nan::cmd", "peers");
    info!(target: "nan::cmd", "---------------------------------------------");

    if state.peers.is_empty() {
        info!(target: "nan::cmd", "no peer(s) added.");
        return;
    }

    for peer in state.peers.iter() {
        let last_update_tu = usec_to_tu(now_usec.saturating_sub(peer.last_update_usec));
        let last_update_dw = last_update_tu / DW_INTERVAL_TU;

        info!(target: "nan::cmd", "peer address             {}", peer.addr);
        info!(target: "nan::cmd", "peer ipv6 address        {}", peer.ipv6_link_local);
        info!(target: "nan::cmd", "peer cluster id          {}", peer.cluster_id);
        info!(target: "nan::cmd", "rssi                     {}", peer.rssi_average());
        info!(target: "nan::cmd", "last update              {} tu ({} dw)", last_update_tu, last_update_dw);
        info!(target: "nan::cmd", "is master candidate?     {}", peer.master_candidate);
        info!(target: "nan::cmd", "");
        info!(target: "nan::cmd", "master rank              {}", peer.master_rank());
        info!(target: "nan::cmd", "master preference        {}", peer.master_preference);
        info!(target: "nan::cmd", "random factor            {}", peer.random_factor);
        info!(target: "nan::cmd", "");
        info!(target: "nan::cmd", "anchor master rank       {}", peer.anchor_master_rank);
        info!(target: "nan::cmd", "ambtt                    {}", peer.ambtt);
        info!(target: "nan::cmd", "hop count to am          {}", peer.hop_count);
        info!(target: "nan::cmd", "");
        info!(target: "nan::cmd", "total shift              {} tu", peer.total_timer_shift_tu);
        info!(target: "nan::cmd", "");
    }
}

fn print_services_info(state: &NanState, args: &str) {
    let print_published = args != "sub";
    let print_subscribed = args != "pub";

    if print_subscribed {
        info!(target: "nan::cmd", "subscribed services");
        info!(target: "nan::cmd", "---------------------------------------------");
        if state.services.subscribed().next().is_none() {
            info!(target: "nan::cmd", "no service(s) subscribed.");
        }
        for service in state.services.subscribed() {
            let ServiceKind::Subscribed {
                subscribe_type,
                is_subscribed,
            } = &service.kind
            else {
                continue;
            };
            info!(target: "nan::cmd", "service name             {}", service.service_name);
            info!(target: "nan::cmd", "service id               {}", service.service_id);
            info!(target: "nan::cmd", "subscribe id             {}", service.instance_id);
            info!(target: "nan::cmd", "type                     {}", subscribe_type.as_str());
            info!(target: "nan::cmd", "time to live             {}", service.time_to_live);
            info!(target: "nan::cmd", "is subscribed?           {}", is_subscribed);
            if !service.service_specific_info.is_empty() {
                info!(
                    target: "nan::cmd",
                    "service info             {}",
                    String::from_utf8_lossy(&service.service_specific_info)
                );
            }
        }
        info!(target: "nan::cmd", "");
    }

    if print_published {
        info!(target: "nan::cmd", "published services");
        info!(target: "nan::cmd", "---------------------------------------------");
        if state.services.published().next().is_none() {
            info!(target: "nan::cmd", "no service(s) published.");
        }
        for service in state.services.published() {
            let ServiceKind::Published { publish_type, .. } = &service.kind else {
                continue;
            };
            info!(target: "nan::cmd", "service name             {}", service.service_name);
            info!(target: "nan::cmd", "service id               {}", service.service_id);
            info!(target: "nan::cmd", "publish id               {}", service.instance_id);
            info!(target: "nan::cmd", "type                     {}", publish_type.as_str());
            info!(target: "nan::cmd", "time to live             {}", service.time_to_live);
            if !service.service_specific_info.is_empty() {
                info!(
                    target: "nan::cmd",
                    "service info             {}",
                    String::from_utf8_lossy(&service.service_specific_info)
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::TimerKind;
    use crate::service::ServiceFilter as Filter;
    use crate::time::ManualClock;
    use nan_wire::EtherAddr;

    fn setup() -> (NanState, CommandState, Outbox, fastrand::Rng, ManualClock) {
        let mut rng = fastrand::Rng::with_seed(9);
        let state = NanState::new(
            "host",
            EtherAddr([2, 0, 0, 0, 0, 1]),
            0,
            &mut rng,
            Config::default(),
        );
        (
            state,
            CommandState::new(),
            Outbox::default(),
            rng,
            ManualClock::new(0),
        )
    }

    fn run(
        state: &mut NanState,
        commands: &mut CommandState,
        outbox: &mut Outbox,
        clock: &ManualClock,
        line: &str,
    ) {
        handle_line(state, commands, outbox, clock, line);
        run_reflexes(state, commands);
    }

    #[test]
    fn publish_registers_service_and_reflex() {
        let (mut state, mut commands, mut outbox, _rng, clock) = setup();

        run(&mut state, &mut commands, &mut outbox, &clock, "publish chat #ff0000");

        let service = state.services.get_by_name("chat", Filter::Published).unwrap();
        assert_eq!(service.service_specific_info, b"#ff0000");
        assert_eq!(commands.reflexes.len(), 1);

        // A duplicate publish is refused.
        run(&mut state, &mut commands, &mut outbox, &clock, "publish chat");
        assert_eq!(state.services.len(), 1);
    }

    #[test]
    fn subscribe_reflex_replies_and_rearms() {
        let (mut state, mut commands, mut outbox, _rng, clock) = setup();
        run(&mut state, &mut commands, &mut outbox, &clock, "subscribe chat");

        let subscribe_id = state
            .services
            .get_by_name("chat", Filter::Subscribed)
            .unwrap()
            .instance_id;
        let peer = EtherAddr([2, 0, 0, 0, 0, 9]);

        // A discovery result arrives through the bus.
        let event = ServiceEvent::DiscoveryResult {
            subscribe_id,
            publish_id: 7,
            address: peer,
            service_update_indicator: 0,
            service_info: vec![],
        };
        state.events.dispatch("chat", &event);
        run_reflexes(&mut state, &mut commands);

        // The follow-up reply was queued for the next DW.
        assert_eq!(state.buffer.len(), 1);
        // And the reflex now waits for the receive event.
        assert_eq!(commands.reflexes.len(), 1);

        let event = ServiceEvent::Receive {
            instance_id: subscribe_id,
            peer_instance_id: 7,
            address: peer,
            service_info: b"hi".to_vec(),
        };
        state.events.dispatch("chat", &event);
        run_reflexes(&mut state, &mut commands);

        // Reply received: the service is retired.
        assert!(state.services.get(subscribe_id).is_none());
        assert!(commands.reflexes.is_empty());
    }

    #[test]
    fn publish_retires_on_reply() {
        let (mut state, mut commands, mut outbox, _rng, clock) = setup();
        run(&mut state, &mut commands, &mut outbox, &clock, "publish chat");
        let publish_id = state
            .services
            .get_by_name("chat", Filter::Published)
            .unwrap()
            .instance_id;

        let event = ServiceEvent::Receive {
            instance_id: publish_id,
            peer_instance_id: 3,
            address: EtherAddr([2, 0, 0, 0, 0, 9]),
            service_info: b"hi".to_vec(),
        };
        state.events.dispatch("chat", &event);
        run_reflexes(&mut state, &mut commands);

        assert!(state.services.get(publish_id).is_none());
    }

    #[test]
    fn set_mp_recomputes_the_rank() {
        let (mut state, mut commands, mut outbox, _rng, clock) = setup();
        let before = state.sync.master_rank;

        run(&mut state, &mut commands, &mut outbox, &clock, "set mp 254");

        assert_eq!(state.sync.master_preference, 254);
        assert!(state.sync.master_rank > before);

        // Bad values are refused.
        run(&mut state, &mut commands, &mut outbox, &clock, "set mp 300");
        assert_eq!(state.sync.master_preference, 254);
    }

    #[test]
    fn desync_needs_two_acknowledging_peers() {
        let (mut state, mut commands, mut outbox, _rng, clock) = setup();

        run(&mut state, &mut commands, &mut outbox, &clock, "set desync 1");
        assert!(!state.desync.enabled);

        // Two peers that follow us as anchor master.
        for last in [8u8, 9] {
            let addr = EtherAddr([2, 0, 0, 0, 0, last]);
            state
                .peers
                .add_or_update(addr, state.cluster.cluster_id, 0, 0);
            state.peers.get_mut(&addr).unwrap().anchor_master_rank = state.sync.master_rank;
        }
        run(&mut state, &mut commands, &mut outbox, &clock, "set desync 1");
        assert!(state.desync.enabled);
    }

    #[test]
    fn peer_timer_shift_keeps_the_shadow() {
        let (mut state, mut commands, mut outbox, _rng, clock) = setup();
        let addr = EtherAddr([2, 0, 0, 0, 0, 9]);
        state
            .peers
            .add_or_update(addr, state.cluster.cluster_id, 0, 1_000);

        run(
            &mut state,
            &mut commands,
            &mut outbox,
            &clock,
            "peer 02:00:00:00:00:09 set timer 50",
        );

        let peer = state.peers.get(&addr).unwrap();
        assert_eq!(peer.old_timer.base_time_usec(), 1_000);
        assert_eq!(peer.timer.base_time_usec(), 1_000 + 50 * 1024);
        assert_eq!(peer.total_timer_shift_tu, 50);
    }

    #[test]
    fn blank_line_repeats_read_only_commands_only() {
        let (mut state, mut commands, mut outbox, _rng, clock) = setup();

        run(&mut state, &mut commands, &mut outbox, &clock, "peers");
        assert_eq!(commands.last_command.as_deref(), Some("peers"));

        run(&mut state, &mut commands, &mut outbox, &clock, "publish chat");
        assert!(commands.last_command.is_none());

        // Blank input with no stored command is a no-op.
        run(&mut state, &mut commands, &mut outbox, &clock, "");
        assert_eq!(state.services.len(), 1);
    }

    #[test]
    fn verbosity_commands_emit_adjustments() {
        let (mut state, mut commands, mut outbox, _rng, clock) = setup();

        run(&mut state, &mut commands, &mut outbox, &clock, "v+");
        run(&mut state, &mut commands, &mut outbox, &clock, "v-");

        let outputs: Vec<Io> = (&mut outbox).collect();
        let deltas: Vec<i8> = outputs
            .iter()
            .filter_map(|io| match io {
                Io::AdjustVerbosity(delta) => Some(*delta),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec![1, -1]);
        // Timer outputs are not produced by commands.
        assert!(!outputs
            .iter()
            .any(|io| matches!(io, Io::SetTimer(TimerKind::DwStart, _))));
    }

    #[test]
    fn peer_rm_removes_the_peer() {
        let (mut state, mut commands, mut outbox, _rng, clock) = setup();
        let addr = EtherAddr([2, 0, 0, 0, 0, 9]);
        state
            .peers
            .add_or_update(addr, state.cluster.cluster_id, 0, 0);

        run(&mut state, &mut commands, &mut outbox, &clock, "peer 02:00 rm");

        assert!(state.peers.get(&addr).is_none());
    }
}
