//! Stand-alone demo: brings up a frontend against an in-process simulated
//! backend, sends a handful of packets, and prints the resulting
//! statistics. Useful for exercising the crate without a real hypervisor.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vif_frontend::address_monitor::{AddressMonitor, StaticAddressSource};
use vif_frontend::buffer::BufferPool;
use vif_frontend::config::DriverConfig;
use vif_frontend::eventchannel::SimEventChannel;
use vif_frontend::fsm::FrontendFsm;
use vif_frontend::grant::SimGrantTable;
use vif_frontend::packet::{CompletionInfo, CompletionStatus, MemoryDescriptor, Packet, SendInfo};
use vif_frontend::stats::{Counter, Destination, RingStatistics};
use vif_frontend::store::{ScopedStore, Store};
use vif_frontend::txring::TxRing;
use vif_frontend::wire::{Response, STATUS_OKAY};

#[derive(Parser, Debug)]
#[command(about = "Drive a simulated VIF frontend for a few packets, then print statistics")]
struct Args {
    /// Number of unicast packets to send.
    #[arg(long, default_value_t = 8)]
    packets: u32,

    /// Payload size in bytes for each packet.
    #[arg(long, default_value_t = 256)]
    payload_len: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let config = DriverConfig::builder().from_env().build();
    let store = Arc::new(Store::new());
    let own = ScopedStore::new(store.clone(), "device/vif/0");
    let backend = ScopedStore::new(store.clone(), "backend/vif/0");

    let fsm = FrontendFsm::new(own.clone(), backend.clone());
    let backend_store = store.clone();
    let handshake = std::thread::spawn(move || {
        let frontend = ScopedStore::new(backend_store.clone(), "device/vif/0");
        let backend = ScopedStore::new(backend_store, "backend/vif/0");
        loop {
            if frontend.read("state").as_deref() == Some("2") {
                backend.write("state", "4").unwrap();
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    });
    fsm.resume()?;
    handshake.join().map_err(|_| anyhow::anyhow!("handshake thread panicked"))?;
    fsm.enable()?;
    tracing::info!(state = ?fsm.state(), "frontend connected");

    let address_monitor = AddressMonitor::new(
        own.clone(),
        Arc::new(StaticAddressSource { ipv4: vec![Ipv4Addr::new(10, 0, 0, 5)], ipv6: vec![] }),
    );
    address_monitor.publish()?;

    let stats = Arc::new(RingStatistics::new(1));
    let ring = TxRing::new(
        config,
        Arc::new(SimGrantTable::new()),
        0,
        SimEventChannel::new(),
        BufferPool::new(256),
        stats.clone(),
    );
    ring.set_connected(true);
    ring.set_enabled(true);

    let packets: Vec<Packet> = (0..args.packets)
        .map(|i| {
            let mut header = vec![0u8; 14];
            header[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 1]);
            header[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 2]);
            header[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
            let _ = i;
            Packet {
                header,
                payload: vec![MemoryDescriptor { data: vec![0xAB; args.payload_len] }],
                send_info: SendInfo::default(),
                outstanding: 0,
                completion: CompletionInfo {
                    destination: Destination::Unicast,
                    status: CompletionStatus::Pending,
                    packet_length: 0,
                    payload_length: 0,
                },
            }
        })
        .collect();

    ring.queue_packets(packets);

    // simulated backend: echo every posted request back as OKAY
    loop {
        let pending = {
            let req_prod = ring.shared_ring().req_prod();
            req_prod
        };
        let rsp_prod = ring.shared_ring().rsp_prod();
        if rsp_prod >= pending {
            break;
        }
        for i in rsp_prod..pending {
            let req = ring.shared_ring().read_request(i);
            ring.shared_ring().write_response(i, Response { id: req.id, status: STATUS_OKAY });
        }
        ring.shared_ring().publish_rsp_prod(pending);
        break;
    }

    let completed = ring.poll();
    tracing::info!(completed = completed.len(), "packets completed");

    fsm.suspend()?;

    println!("unicast packets sent: {}", stats.tx.get(Counter::UnicastPackets));
    println!("unicast octets sent: {}", stats.tx.get(Counter::UnicastOctets));
    println!("packets dropped: {}", stats.tx.get(Counter::PacketsDropped));
    Ok(())
}
