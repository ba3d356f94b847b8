//! Tunnel drivers: how a provider installs and retires ESP state for a NIC.
//!
//! A driver is chosen per provider when the progs are built
//! ([ProviderDrivers]); the rekey workflow itself never branches on the
//! provider.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv6Addr;
use std::sync::Arc;

use shell_escape::unix::escape;

use crate::command::CommandRunner;
use crate::error::VnetError;
use crate::model::{KeyMaterial, Nic, NicTunnels, VmPlacement};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropOutcome {
    /// The NIC had no tunnels; all state was flushed at once.
    Early,
    Dropped(usize),
}

pub trait TunnelDriver: Send + Sync {
    /// Installs forward SAs and policies for traffic arriving under the
    /// peers' new keys.
    fn setup_inbound(&self, tunnels: &NicTunnels) -> Result<(), VnetError>;

    /// Switches outgoing traffic to this NIC's new key.
    fn setup_outbound(&self, tunnels: &NicTunnels) -> Result<(), VnetError>;

    /// Removes every SA that is not part of the new key set.
    fn drop_old_state(&self, tunnels: &NicTunnels) -> Result<DropOutcome, VnetError>;
}

#[derive(Clone, Default)]
pub struct ProviderDrivers {
    drivers: BTreeMap<String, Arc<dyn TunnelDriver>>,
}

impl ProviderDrivers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: impl Into<String>, driver: Arc<dyn TunnelDriver>) -> Self {
        self.drivers.insert(provider.into(), driver);
        self
    }

    pub fn driver_for(&self, provider: &str) -> Result<Arc<dyn TunnelDriver>, VnetError> {
        self.drivers
            .get(provider)
            .cloned()
            .ok_or_else(|| VnetError::NoDriver(provider.to_string()))
    }
}

/// Linux xfrm driver over SSH.
pub struct XfrmTunnelDriver {
    runner: Arc<dyn CommandRunner>,
}

impl XfrmTunnelDriver {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl TunnelDriver for XfrmTunnelDriver {
    fn setup_inbound(&self, tunnels: &NicTunnels) -> Result<(), VnetError> {
        let local = placement(&tunnels.nic)?;
        for src in &tunnels.inbound {
            let Some(policy) =
                XfrmPolicy::new(&tunnels.nic, local, src, &tunnels.nic, Direction::Forward)?
            else {
                continue;
            };
            policy.create_state(self.runner.as_ref())?;
            policy.upsert_policy(self.runner.as_ref())?;
        }
        Ok(())
    }

    fn setup_outbound(&self, tunnels: &NicTunnels) -> Result<(), VnetError> {
        let local = placement(&tunnels.nic)?;
        for dst in &tunnels.outbound {
            let Some(policy) =
                XfrmPolicy::new(&tunnels.nic, local, &tunnels.nic, dst, Direction::Out)?
            else {
                continue;
            };
            policy.create_state(self.runner.as_ref())?;
            policy.upsert_policy(self.runner.as_ref())?;
            policy.create_private_routes(self.runner.as_ref())?;
        }
        Ok(())
    }

    fn drop_old_state(&self, tunnels: &NicTunnels) -> Result<DropOutcome, VnetError> {
        let local = placement(&tunnels.nic)?;
        let namespace = escape(local.inhost_name.as_str().into());
        if tunnels.inbound.is_empty() && tunnels.outbound.is_empty() {
            self.runner.cmd(
                &local.host,
                &format!("sudo ip -n {namespace} xfrm state deleteall"),
                None,
            )?;
            return Ok(DropOutcome::Early);
        }

        let mut keep: HashSet<&str> = HashSet::new();
        let peers = std::iter::once(&tunnels.nic).chain(tunnels.inbound.iter());
        for key in peers.filter_map(|nic| nic.pending_key.as_ref()) {
            keep.insert(key.spi4.as_str());
            keep.insert(key.spi6.as_str());
        }

        let listing = self.runner.cmd(
            &local.host,
            &format!("sudo ip -n {namespace} xfrm state"),
            None,
        )?;
        let mut dropped = 0;
        for state in parse_xfrm_states(&listing) {
            if keep.contains(state.spi.as_str()) {
                continue;
            }
            self.runner.cmd(
                &local.host,
                &format!(
                    "sudo ip -n {namespace} xfrm state delete src {} dst {} proto esp spi {}",
                    escape(state.src.as_str().into()),
                    escape(state.dst.as_str().into()),
                    escape(state.spi.as_str().into()),
                ),
                None,
            )?;
            dropped += 1;
        }
        Ok(DropOutcome::Dropped(dropped))
    }
}

fn placement(nic: &Nic) -> Result<&VmPlacement, VnetError> {
    nic.vm.as_ref().ok_or(VnetError::NoPlacement(nic.id))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Forward,
    Out,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "fwd",
            Self::Out => "out",
        }
    }
}

/// One tunnel as seen from the namespace of the local NIC's VM.
struct XfrmPolicy<'a> {
    host: &'a str,
    namespace: String,
    src: &'a Nic,
    dst: &'a Nic,
    tmpl_src: String,
    tmpl_dst: String,
    key: &'a KeyMaterial,
    direction: Direction,
}

impl<'a> XfrmPolicy<'a> {
    /// `None` when the sending NIC has no pending key or a peer has no VM.
    fn new(
        local: &'a Nic,
        placement: &'a VmPlacement,
        src: &'a Nic,
        dst: &'a Nic,
        direction: Direction,
    ) -> Result<Option<Self>, VnetError> {
        let (Some(key), Some(src_vm), Some(dst_vm)) =
            (src.pending_key.as_ref(), src.vm.as_ref(), dst.vm.as_ref())
        else {
            tracing::debug!(nic_id = %local.id, src = %src.id, dst = %dst.id, "tunnel skipped");
            return Ok(None);
        };
        Ok(Some(Self {
            host: &placement.host,
            namespace: escape(placement.inhost_name.as_str().into()).into_owned(),
            src,
            dst,
            tmpl_src: subdivide_network(&src_vm.ephemeral_net6)?,
            tmpl_dst: subdivide_network(&dst_vm.ephemeral_net6)?,
            key,
            direction,
        }))
    }

    fn create_state(&self, runner: &dyn CommandRunner) -> Result<(), VnetError> {
        self.create_xfrm_state(runner, &self.key.spi4, true)?;
        self.create_xfrm_state(runner, &self.key.spi6, false)
    }

    fn create_xfrm_state(
        &self,
        runner: &dyn CommandRunner,
        spi: &str,
        ipv4: bool,
    ) -> Result<(), VnetError> {
        let selector = if ipv4 {
            " sel src 0.0.0.0/0 dst 0.0.0.0/0"
        } else {
            ""
        };
        let command = format!(
            "sudo -- xargs -I {{}} -- ip -n {} xfrm state add src {} dst {} proto esp spi {} reqid {} mode tunnel aead 'rfc4106(gcm(aes))' {{}} 128{}",
            self.namespace,
            self.tmpl_src,
            self.tmpl_dst,
            escape(spi.into()),
            self.key.reqid,
            selector
        );
        match runner.cmd(self.host, &command, Some(&self.key.encryption_key)) {
            Ok(_) => Ok(()),
            // The state survived an earlier attempt of this step.
            Err(err) if err.stderr().contains("File exists") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn upsert_policy(&self, runner: &dyn CommandRunner) -> Result<(), VnetError> {
        self.apply_policy(runner, &self.src.private_ipv4, &self.dst.private_ipv4)?;
        self.apply_policy(runner, &self.src.private_ipv6, &self.dst.private_ipv6)
    }

    fn apply_policy(
        &self,
        runner: &dyn CommandRunner,
        src: &str,
        dst: &str,
    ) -> Result<(), VnetError> {
        let exists = !runner
            .cmd(self.host, &self.policy_command(src, dst, "show"), None)?
            .trim()
            .is_empty();
        if exists && self.direction == Direction::Forward {
            return Ok(());
        }
        let verb = if exists { "update" } else { "add" };
        runner.cmd(self.host, &self.policy_command(src, dst, verb), None)?;
        Ok(())
    }

    fn policy_command(&self, src: &str, dst: &str, verb: &str) -> String {
        let base = format!(
            "sudo ip -n {} xfrm policy {verb} src {} dst {} dir {}",
            self.namespace,
            escape(src.into()),
            escape(dst.into()),
            self.direction.as_str()
        );
        if verb == "show" {
            return base;
        }
        let reqid = match self.direction {
            Direction::Forward => 0,
            Direction::Out => self.key.reqid,
        };
        format!(
            "{base} tmpl src {} dst {} proto esp reqid {reqid} mode tunnel",
            self.tmpl_src, self.tmpl_dst
        )
    }

    fn create_private_routes(&self, runner: &dyn CommandRunner) -> Result<(), VnetError> {
        for dst_ip in [&self.dst.private_ipv6, &self.dst.private_ipv4] {
            runner.cmd(
                self.host,
                &format!(
                    "sudo ip -n {ns} route replace {} dev vethi{ns}",
                    escape(dst_ip.as_str().into()),
                    ns = self.namespace
                ),
                None,
            )?;
        }
        Ok(())
    }
}

/// Upper half of an IPv6 network: `2001:db8::/64` becomes
/// `2001:db8:0:0:8000::/65`. Tunnel endpoints live in that half.
pub fn subdivide_network(net: &str) -> Result<String, VnetError> {
    let invalid = || VnetError::InvalidNetwork(net.to_string());
    let (addr, prefix) = net.split_once('/').ok_or_else(invalid)?;
    let addr: Ipv6Addr = addr.parse().map_err(|_| invalid())?;
    let prefix: u32 = prefix.parse().map_err(|_| invalid())?;
    if prefix >= 128 {
        return Err(invalid());
    }
    let halved = prefix + 1;
    let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
    let network = (u128::from(addr) & mask) | (1u128 << (128 - halved));
    Ok(format!("{}/{}", Ipv6Addr::from(network), halved))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XfrmState {
    pub src: String,
    pub dst: String,
    pub spi: String,
}

/// ESP states from `ip xfrm state` output.
pub fn parse_xfrm_states(listing: &str) -> Vec<XfrmState> {
    let mut states = Vec::new();
    let mut current: Option<(String, String)> = None;
    for line in listing.lines() {
        let mut words = line.split_whitespace();
        if line.starts_with("src ") {
            current = match (words.next(), words.next(), words.next(), words.next()) {
                (Some("src"), Some(src), Some("dst"), Some(dst)) => {
                    Some((src.to_string(), dst.to_string()))
                }
                _ => None,
            };
            continue;
        }
        let Some((src, dst)) = current.as_ref() else {
            continue;
        };
        let words: Vec<&str> = words.collect();
        if let Some(pos) = words
            .windows(4)
            .position(|w| w[0] == "proto" && w[1] == "esp" && w[2] == "spi")
        {
            states.push(XfrmState {
                src: src.clone(),
                dst: dst.clone(),
                spi: words[pos + 3].to_string(),
            });
            current = None;
        }
    }
    states
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use uuid::Uuid;

    use super::*;
    use crate::command::{CommandError, CommandOutput};

    /// Records every command; answers `ip xfrm state` with a fixed listing
    /// and fails state creation with "File exists".
    #[derive(Default)]
    struct RecordingRunner {
        commands: Mutex<Vec<String>>,
        listing: String,
        existing_policies: bool,
    }

    impl CommandRunner for RecordingRunner {
        fn run(
            &self,
            _host: &str,
            command: &str,
            _stdin: Option<&str>,
        ) -> Result<CommandOutput, CommandError> {
            self.commands.lock().unwrap().push(command.to_string());
            let ok = |stdout: &str| CommandOutput {
                code: Some(0),
                stdout: stdout.to_string(),
                stderr: String::new(),
            };
            if command.contains("xfrm state add") {
                return Ok(CommandOutput {
                    code: Some(2),
                    stdout: String::new(),
                    stderr: "RTNETLINK answers: File exists".into(),
                });
            }
            if command.contains("xfrm policy show") {
                return Ok(ok(if self.existing_policies { "src 10.0.0.2/32" } else { "" }));
            }
            if command.ends_with("xfrm state") {
                return Ok(ok(&self.listing));
            }
            Ok(ok(""))
        }
    }

    fn nic(name: &str, last: u8, spi: &str) -> Nic {
        let mut nic = Nic::new(
            Uuid::new_v4(),
            name,
            format!("10.0.0.{last}"),
            format!("fd00::{last}"),
        );
        nic.vm = Some(VmPlacement {
            vm_id: Uuid::new_v4(),
            host: format!("host-{name}"),
            inhost_name: format!("vm{name}"),
            ephemeral_net6: format!("2a01:4f8:10a:{last}::/64"),
        });
        nic.pending_key = Some(KeyMaterial {
            encryption_key: "0xfeed".into(),
            spi4: format!("{spi}4"),
            spi6: format!("{spi}6"),
            reqid: u32::from(last),
        });
        nic
    }

    #[test]
    fn subdivide_takes_the_upper_half() {
        assert_eq!(
            subdivide_network("2a01:4f8:10a:128b::/64").unwrap(),
            "2a01:4f8:10a:128b:8000::/65"
        );
        assert_eq!(
            subdivide_network("2a01:4f8:10a:128b:814c::/79").unwrap(),
            "2a01:4f8:10a:128b:814d::/80"
        );
        assert!(subdivide_network("10.0.0.0/8").is_err());
        assert!(subdivide_network("2a01::/128").is_err());
    }

    #[test]
    fn parses_esp_states_across_lines() {
        let listing = "src 2a01::1 dst 2a01::2\n\tproto esp spi 0x0000aaaa reqid 5 mode tunnel\n\treplay-window 0\nsrc 2a01::2 dst 2a01::1\n\tproto esp spi 0x0000bbbb reqid 6 mode tunnel\n";
        let states = parse_xfrm_states(listing);
        assert_eq!(states.len(), 2);
        assert_eq!(states[1].src, "2a01::2");
        assert_eq!(states[1].spi, "0x0000bbbb");
    }

    #[test]
    fn inbound_tolerates_existing_state_and_skips_existing_forward_policies() {
        let runner = Arc::new(RecordingRunner {
            existing_policies: true,
            ..RecordingRunner::default()
        });
        let driver = XfrmTunnelDriver::new(runner.clone());
        let local = nic("a", 2, "0xa");
        let peer = nic("b", 3, "0xb");
        let tunnels = NicTunnels {
            nic: local,
            inbound: vec![peer],
            outbound: Vec::new(),
        };
        driver.setup_inbound(&tunnels).unwrap();

        let commands = runner.commands.lock().unwrap();
        assert_eq!(commands.iter().filter(|c| c.contains("state add")).count(), 2);
        assert!(commands.iter().all(|c| !c.contains("policy add")));
        assert!(commands.iter().any(|c| c.contains("spi 0xb4 reqid 3")));
    }

    #[test]
    fn outbound_adds_policies_and_routes() {
        let runner = Arc::new(RecordingRunner::default());
        let driver = XfrmTunnelDriver::new(runner.clone());
        let tunnels = NicTunnels {
            nic: nic("a", 2, "0xa"),
            inbound: Vec::new(),
            outbound: vec![nic("b", 3, "0xb")],
        };
        driver.setup_outbound(&tunnels).unwrap();

        let commands = runner.commands.lock().unwrap();
        assert!(commands
            .iter()
            .any(|c| c.contains("policy add src 10.0.0.2 dst 10.0.0.3 dir out") && c.contains("reqid 2")));
        assert!(commands.iter().any(|c| c.contains("route replace")
            && c.contains("fd00::3")
            && c.ends_with("dev vethivma")));
    }

    #[test]
    fn drop_keeps_new_spis_only() {
        let runner = Arc::new(RecordingRunner {
            listing: "src a dst b\n\tproto esp spi 0xa4 reqid 2\nsrc b dst a\n\tproto esp spi 0xold reqid 1\n".into(),
            ..RecordingRunner::default()
        });
        let driver = XfrmTunnelDriver::new(runner.clone());
        let tunnels = NicTunnels {
            nic: nic("a", 2, "0xa"),
            inbound: vec![nic("b", 3, "0xb")],
            outbound: Vec::new(),
        };
        assert_eq!(driver.drop_old_state(&tunnels).unwrap(), DropOutcome::Dropped(1));
        let commands = runner.commands.lock().unwrap();
        assert!(commands
            .last()
            .is_some_and(|c| c.ends_with("state delete src b dst a proto esp spi 0xold")));
    }

    #[test]
    fn drop_without_tunnels_flushes_everything() {
        let runner = Arc::new(RecordingRunner::default());
        let driver = XfrmTunnelDriver::new(runner.clone());
        let tunnels = NicTunnels {
            nic: nic("a", 2, "0xa"),
            inbound: Vec::new(),
            outbound: Vec::new(),
        };
        assert_eq!(driver.drop_old_state(&tunnels).unwrap(), DropOutcome::Early);
        assert_eq!(
            runner.commands.lock().unwrap().as_slice(),
            ["sudo ip -n vma xfrm state deleteall"]
        );
    }

    #[test]
    fn unknown_provider_has_no_driver() {
        let drivers = ProviderDrivers::new().with(
            "metal",
            Arc::new(XfrmTunnelDriver::new(Arc::new(RecordingRunner::default()))),
        );
        assert!(drivers.driver_for("metal").is_ok());
        assert!(matches!(drivers.driver_for("aws"), Err(VnetError::NoDriver(_))));
    }
}
