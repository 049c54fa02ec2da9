//! Device record change -> resolve action selection.
//!
//! A device handler observes its persisted [`SyncRuntimeInfo`] as a stream
//! of values. For every new value it calls [`transition`] with the previous
//! one and executes the returned actions in order. This function is pure:
//! the same pair of records always yields the same actions.

use sync_types::{ConnectState, SyncRuntimeInfo};

/// Which resolver entry point an event targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolveWay {
    /// Look for a reachable host from scratch.
    Disconnected,
    /// Verify the bound host (heartbeat or token trust).
    Connecting,
    /// Pick `Disconnected` or `Connecting` from the record itself.
    Connection,
    /// Refresh discovery first, then resolve as `Connection`.
    ForceConnection,
}

/// What a handler should do in response to a record change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Emit a resolve event.
    Resolve(ResolveWay),
    /// Ask discovery for fresh info about this device.
    RefreshSyncInfo,
    /// Count a failure in the poll scheduler.
    SchedulerFail,
    /// Clear the poll scheduler's failure count.
    SchedulerReset,
}

/// Resolve entry point for a record in the given state.
pub fn resolve_way_for(state: ConnectState) -> ResolveWay {
    match state {
        ConnectState::Connecting => ResolveWay::Connecting,
        ConnectState::Connected => ResolveWay::Connection,
        ConnectState::Disconnected
        | ConnectState::Incompatible
        | ConnectState::Unmatched
        | ConnectState::Unverified => ResolveWay::Disconnected,
    }
}

/// Actions for the first observed value of a record.
pub fn initial_action(curr: &SyncRuntimeInfo) -> Vec<Action> {
    transition(None, curr)
}

/// Actions for a record change from `prev` to `curr`.
///
/// `prev` is `None` on the first observation. At most one
/// [`Action::SchedulerFail`] is returned per call.
pub fn transition(prev: Option<&SyncRuntimeInfo>, curr: &SyncRuntimeInfo) -> Vec<Action> {
    let mut actions = match prev {
        None => vec![Action::Resolve(resolve_way_for(curr.connect_state))],
        Some(prev) => on_change(prev, curr),
    };

    if curr.connect_state.is_failure() && !actions.contains(&Action::SchedulerFail) {
        actions.push(Action::SchedulerFail);
    }
    actions
}

fn on_change(prev: &SyncRuntimeInfo, curr: &SyncRuntimeInfo) -> Vec<Action> {
    if prev.port != curr.port {
        return vec![Action::Resolve(ResolveWay::Connection)];
    }

    if let (Some(prev_host), Some(curr_host)) = (
        prev.connect_host_address.as_deref(),
        curr.connect_host_address.as_deref(),
    ) {
        if prev_host != curr_host {
            return vec![Action::Resolve(ResolveWay::Connection)];
        }
    }

    if prev.connect_state != curr.connect_state {
        return match curr.connect_state {
            ConnectState::Disconnected
            | ConnectState::Incompatible
            | ConnectState::Unmatched
            | ConnectState::Unverified => {
                vec![Action::SchedulerFail, Action::RefreshSyncInfo]
            }
            ConnectState::Connecting => vec![Action::Resolve(ResolveWay::Connecting)],
            ConnectState::Connected => vec![
                Action::SchedulerReset,
                Action::Resolve(ResolveWay::Connection),
            ],
        };
    }

    if prev.host_info_list != curr.host_info_list
        && curr.connect_state == ConnectState::Connected
    {
        return vec![Action::Resolve(ResolveWay::Connection)];
    }

    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::{DeviceIdentity, HostInfo, InstanceId, Platform, SyncInfo};

    fn record(state: ConnectState, host: Option<&str>) -> SyncRuntimeInfo {
        let info = SyncInfo {
            identity: DeviceIdentity {
                instance_id: InstanceId::new("dev-a"),
                device_id: "hw".into(),
                device_name: "A".into(),
                platform: Platform {
                    name: "Linux".into(),
                    arch: "x86_64".into(),
                    bit_mode: 64,
                    version: "6".into(),
                },
            },
            app_version: "1.0.0".into(),
            host_info_list: vec![HostInfo::new("10.0.0.2", 24)],
            port: 13129,
        };
        let mut record = SyncRuntimeInfo::from_sync_info(info, 0);
        record.connect_state = state;
        record.connect_host_address = host.map(str::to_string);
        record
    }

    #[test]
    fn first_observation_resolves_by_state() {
        assert_eq!(
            initial_action(&record(ConnectState::Connecting, Some("10.0.0.2"))),
            vec![Action::Resolve(ResolveWay::Connecting)]
        );
        assert_eq!(
            initial_action(&record(ConnectState::Connected, Some("10.0.0.2"))),
            vec![Action::Resolve(ResolveWay::Connection)]
        );
        for state in [
            ConnectState::Disconnected,
            ConnectState::Incompatible,
            ConnectState::Unmatched,
            ConnectState::Unverified,
        ] {
            assert_eq!(
                initial_action(&record(state, None)),
                vec![
                    Action::Resolve(ResolveWay::Disconnected),
                    Action::SchedulerFail
                ],
                "state {}",
                state
            );
        }
    }

    #[test]
    fn port_change_wins_over_everything() {
        let prev = record(ConnectState::Connected, Some("10.0.0.2"));
        let mut curr = record(ConnectState::Disconnected, None);
        curr.port = 14000;
        assert_eq!(
            transition(Some(&prev), &curr),
            vec![
                Action::Resolve(ResolveWay::Connection),
                Action::SchedulerFail
            ]
        );
    }

    #[test]
    fn host_address_change_re_resolves() {
        let prev = record(ConnectState::Connected, Some("10.0.0.2"));
        let curr = record(ConnectState::Connected, Some("10.0.0.9"));
        assert_eq!(
            transition(Some(&prev), &curr),
            vec![Action::Resolve(ResolveWay::Connection)]
        );
    }

    #[test]
    fn host_address_cleared_is_a_state_change_not_an_address_change() {
        let prev = record(ConnectState::Connecting, Some("10.0.0.2"));
        let curr = record(ConnectState::Disconnected, None);
        assert_eq!(
            transition(Some(&prev), &curr),
            vec![Action::SchedulerFail, Action::RefreshSyncInfo]
        );
    }

    #[test]
    fn state_changes() {
        let disconnected = record(ConnectState::Disconnected, None);
        let connecting = record(ConnectState::Connecting, Some("10.0.0.2"));
        let connected = record(ConnectState::Connected, Some("10.0.0.2"));
        let unverified = record(ConnectState::Unverified, Some("10.0.0.2"));

        assert_eq!(
            transition(Some(&disconnected), &connecting),
            vec![Action::Resolve(ResolveWay::Connecting)]
        );
        assert_eq!(
            transition(Some(&connecting), &connected),
            vec![
                Action::SchedulerReset,
                Action::Resolve(ResolveWay::Connection)
            ]
        );
        assert_eq!(
            transition(Some(&connecting), &unverified),
            vec![Action::SchedulerFail, Action::RefreshSyncInfo]
        );
    }

    #[test]
    fn candidate_list_change_only_matters_when_connected() {
        let prev = record(ConnectState::Connected, Some("10.0.0.2"));
        let mut curr = prev.clone();
        curr.host_info_list.push(HostInfo::new("192.168.1.4", 24));
        assert_eq!(
            transition(Some(&prev), &curr),
            vec![Action::Resolve(ResolveWay::Connection)]
        );

        let prev = record(ConnectState::Connecting, Some("10.0.0.2"));
        let mut curr = prev.clone();
        curr.host_info_list.clear();
        assert!(transition(Some(&prev), &curr).is_empty());
    }

    #[test]
    fn unchanged_failure_state_still_counts_a_failure() {
        let prev = record(ConnectState::Incompatible, Some("10.0.0.2"));
        let mut curr = prev.clone();
        curr.modify_time = 99;
        assert_eq!(transition(Some(&prev), &curr), vec![Action::SchedulerFail]);
    }

    #[test]
    fn flag_only_change_on_healthy_link_is_silent() {
        let prev = record(ConnectState::Connected, Some("10.0.0.2"));
        let mut curr = prev.clone();
        curr.allow_send = false;
        curr.note_name = Some("Desk".into());
        assert!(transition(Some(&prev), &curr).is_empty());
    }

    #[test]
    fn transition_is_deterministic() {
        let states = [
            ConnectState::Disconnected,
            ConnectState::Connecting,
            ConnectState::Connected,
            ConnectState::Incompatible,
            ConnectState::Unmatched,
            ConnectState::Unverified,
        ];
        for from in states {
            for to in states {
                let prev = record(from, from.may_carry_host().then_some("10.0.0.2"));
                let curr = record(to, to.may_carry_host().then_some("10.0.0.3"));
                let first = transition(Some(&prev), &curr);
                let second = transition(Some(&prev.clone()), &curr.clone());
                assert_eq!(first, second, "{} -> {}", from, to);
                assert!(
                    first.iter().filter(|a| **a == Action::SchedulerFail).count() <= 1
                );
            }
        }
    }
}
