//! Read-only diagnostic commands.
//!
//! A console task feeds lines in and prints what comes back. Nothing here
//! mutates the node.

use core::fmt::{self, Write};

use crate::config::MeshConfig;
use crate::node::Node;
use crate::traits::{Cipher, Clock, PositionSource, Radio};
use crate::types::{Error, Result};

const HELP: &str = "\
help             this text
status           address, role, counters and radio settings
childnodes       registered child nodes
multicastgroups  registered multicast groups
scheduler        slot handlers and reservations
neighbors        nodes heard in the advertising slot
";

impl<R, Cip, Clk, P, C> Node<R, Cip, Clk, P, C>
where
    R: Radio,
    Cip: Cipher,
    Clk: Clock,
    P: PositionSource,
    C: MeshConfig,
{
    /// Run one shell command and write its output to `out`.
    ///
    /// Unknown commands return `InvalidType`.
    pub fn shell_command<W: Write>(&self, line: &str, out: &mut W) -> Result<()> {
        let written = match line.trim() {
            "help" => out.write_str(HELP),
            "status" => self.shell_status(out),
            "childnodes" => self.shell_child_nodes(out),
            "multicastgroups" => self.shell_multicast_groups(out),
            "scheduler" => self.shell_scheduler(out),
            "neighbors" => self.shell_neighbors(out),
            _ => return Err(Error::InvalidType),
        };
        written.map_err(|_| Error::Overflow)
    }

    fn shell_status<W: Write>(&self, out: &mut W) -> fmt::Result {
        let d = &self.device;
        writeln!(out, "addr:        {:08x}", d.dev_addr)?;
        writeln!(out, "net id:      {:06x}", d.net_id)?;
        writeln!(out, "role:        {}", d.role)?;
        writeln!(out, "class:       {}", d.class)?;
        writeln!(out, "rank:        {}", self.rank())?;
        writeln!(out, "coordinator: {:08x}", d.coordinator)?;
        match self.parent {
            Some(parent) => writeln!(out, "parent:      {:08x}", parent)?,
            None => writeln!(out, "parent:      -")?,
        }
        writeln!(
            out,
            "fcnt:        up {} down {}",
            d.uplink_counter, d.downlink_counter
        )?;
        writeln!(
            out,
            "radio:       ch {} DR{} power {} mask {:04x}",
            d.channel, d.datarate, d.tx_power, d.channel_mask
        )?;
        writeln!(out, "flags:       {:?} {:?}", d.ctrl, d.debug)?;
        writeln!(
            out,
            "duty cycle:  wait {} ms",
            self.channels
                .next_band_available(self.clock.now(), d.channel_mask)
                .as_millis()
        )?;
        let stats = self.phy.stats();
        writeln!(
            out,
            "phy:         tx {} rx {} dropped {} deferred {}",
            stats.tx_frames, stats.rx_frames, stats.rx_dropped, stats.tx_deferred
        )
    }

    fn shell_child_nodes<W: Write>(&self, out: &mut W) -> fmt::Result {
        writeln!(
            out,
            "{} of {} child nodes",
            self.children.len(),
            self.children.capacity()
        )?;
        for c in self.children.iter() {
            writeln!(
                out,
                "  {:08x} class {} fcnt up {} down {} every {} s",
                c.dev_addr,
                c.class,
                c.uplink_counter,
                c.downlink_counter,
                c.periodicity.as_secs()
            )?;
        }
        Ok(())
    }

    fn shell_multicast_groups<W: Write>(&self, out: &mut W) -> fmt::Result {
        writeln!(
            out,
            "{} of {} multicast groups",
            self.multicast.len(),
            self.multicast.capacity()
        )?;
        for g in self.multicast.iter() {
            writeln!(
                out,
                "  {:08x} fcnt {} every {} s{}",
                g.address,
                g.downlink_counter,
                g.periodicity.as_secs(),
                if g.handler.is_some() { "" } else { " (unscheduled)" }
            )?;
        }
        Ok(())
    }

    fn shell_scheduler<W: Write>(&self, out: &mut W) -> fmt::Result {
        writeln!(out, "handlers:")?;
        for (key, h) in self.scheduler.handlers() {
            writeln!(
                out,
                "  {:?} {} every {} ms ctx {:08x} ({} instances)",
                key,
                h.event_type,
                h.period.as_millis(),
                h.context,
                self.scheduler.instances(key)
            )?;
        }
        writeln!(out, "events:")?;
        for (_, e) in self.scheduler.events() {
            let kind = self.scheduler.handler(e.handler).map(|h| h.event_type);
            match kind {
                Some(kind) => writeln!(out, "  [{:3}, {:3}) {}", e.start, e.end, kind)?,
                None => writeln!(out, "  [{:3}, {:3}) ?", e.start, e.end)?,
            }
        }
        Ok(())
    }

    fn shell_neighbors<W: Write>(&self, out: &mut W) -> fmt::Result {
        writeln!(out, "{} neighbors", self.neighbors.len())?;
        for n in self.neighbors.iter() {
            writeln!(
                out,
                "  {:08x} {} rank {} coordinator {:08x} rssi {} snr {} seen {} ms",
                n.dev_addr,
                n.role,
                n.rank,
                n.coordinator,
                n.rssi,
                n.snr,
                n.last_seen.as_millis()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::String;

    use super::*;
    use crate::config::{DefaultConfig, MeshSettings};
    use crate::crypto::AesCmacCipher;
    use crate::registry::{ChildNode, MulticastGroup};
    use crate::time::{Duration, Timestamp};
    use crate::traits::test_impls::{FixedPosition, MockClock, MockRadio};
    use crate::types::SessionKeys;

    type TestNode = Node<MockRadio, AesCmacCipher, MockClock, FixedPosition, DefaultConfig>;

    const KEYS: SessionKeys = SessionKeys::new([1; 16], [2; 16]);

    fn make_node() -> TestNode {
        let mut node = Node::new(
            MockRadio::new(),
            AesCmacCipher::new(),
            MockClock::new(),
            FixedPosition::none(),
            MeshSettings::new(),
        )
        .unwrap();
        node.join_abp(0x2600_0001, 0x13, KEYS).unwrap();
        node
    }

    #[test]
    fn test_status() {
        let node = make_node();
        let mut out = String::new();
        node.shell_command("status", &mut out).unwrap();
        assert!(out.contains("addr:        26000001"));
        assert!(out.contains("role:        NODE"));
        assert!(out.contains("NETWORK_JOINED"));
    }

    #[test]
    fn test_status_shows_duty_cycle_wait() {
        let mut node = make_node();
        node.channels
            .record_tx(0, Timestamp::ZERO, Duration::from_millis(100));
        node.clock.set(Timestamp::from_secs(4));
        let mut out = String::new();
        node.shell_command("status", &mut out).unwrap();
        assert!(out.contains("duty cycle:  wait 5900 ms"));
    }

    #[test]
    fn test_registries_listed() {
        let mut node = make_node();
        node.add_child_node(ChildNode::new(0x2600_1000, KEYS)).unwrap();
        node.add_multicast_group(MulticastGroup::new(0xff00_0001, KEYS))
            .unwrap();

        let mut out = String::new();
        node.shell_command("childnodes", &mut out).unwrap();
        assert!(out.starts_with("1 of 16 child nodes"));
        assert!(out.contains("26001000"));

        out.clear();
        node.shell_command(" multicastgroups ", &mut out).unwrap();
        assert!(out.contains("ff000001 fcnt 0 every 0 s (unscheduled)"));
    }

    #[test]
    fn test_scheduler_listing() {
        let mut node = make_node();
        node.register_transmission(10, Duration::from_secs(16)).unwrap();
        let mut out = String::new();
        node.shell_command("scheduler", &mut out).unwrap();
        assert!(out.contains("UPLINK every 16000 ms"));
        assert!(out.contains("[  0,   5) UPLINK"));
        assert!(out.contains("[ 10,  15) RX1"));
    }

    #[test]
    fn test_read_only() {
        let node = make_node();
        let before = node.device().clone();
        let mut out = String::new();
        for cmd in ["help", "status", "childnodes", "multicastgroups", "scheduler", "neighbors"] {
            node.shell_command(cmd, &mut out).unwrap();
        }
        assert_eq!(node.device().uplink_counter, before.uplink_counter);
        assert!(out.contains("0 neighbors"));
    }

    #[test]
    fn test_unknown_command() {
        let node = make_node();
        let mut out = String::new();
        assert_eq!(node.shell_command("reboot", &mut out), Err(Error::InvalidType));
        assert!(out.is_empty());
    }
}
