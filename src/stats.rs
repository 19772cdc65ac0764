use std::time::Duration;

use serde::Serialize;
use sysinfo::{Disks, MINIMUM_CPU_UPDATE_INTERVAL, System};
use tokio::time::sleep;

const MIB: u64 = 1024 * 1024;

#[derive(Serialize, Debug)]
pub struct Stats {
    pub cpu: f32,
    pub ram_mb: u64,
    pub ram_total_mb: u64,
    pub swap_mb: u64,
    pub load_average: [f64; 3],
    pub disks: Vec<DiskStats>,
    pub host_uptime: String,
    pub uptime: String,
}

#[derive(Serialize, Debug)]
pub struct DiskStats {
    pub mount_point: String,
    pub total_mb: u64,
    pub available_mb: u64,
}

/// CPU usage needs two samples, so this waits at least one update interval.
pub async fn cpu_percent() -> f32 {
    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
    sys.refresh_cpu_usage();
    sys.global_cpu_usage()
}

pub async fn snapshot(service_uptime: Duration) -> Stats {
    let cpu = cpu_percent().await;

    let mut sys = System::new();
    sys.refresh_memory();
    let load = System::load_average();

    let disks = Disks::new_with_refreshed_list()
        .list()
        .iter()
        .map(|disk| DiskStats {
            mount_point: disk.mount_point().display().to_string(),
            total_mb: disk.total_space() / MIB,
            available_mb: disk.available_space() / MIB,
        })
        .collect();

    Stats {
        cpu,
        ram_mb: sys.used_memory() / MIB,
        ram_total_mb: sys.total_memory() / MIB,
        swap_mb: sys.used_swap() / MIB,
        load_average: [load.one, load.five, load.fifteen],
        disks,
        host_uptime: format_uptime(Duration::from_secs(System::uptime())),
        uptime: format_uptime(service_uptime),
    }
}

pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (h, rest) = (secs / 3600, secs % 3600);
    let (m, s) = (rest / 60, rest % 60);
    format!("{h}h {m}m {s}s")
}
