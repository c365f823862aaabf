//! Host and VM statistics from RRD exports
//!
//! The pool publishes round-robin database updates as an `xport` XML
//! document: a legend of `<cf>:<kind>:<uuid>:<param>` column names followed by
//! rows of samples. Averages skip `NaN` samples.

use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use crate::config::StatsSettings;
use crate::mgmt::SessionRef;
use crate::session::Connection;
use crate::{Error, Result};

/// Somewhere RRD exports can be fetched from.
pub trait RrdSource: Send + Sync {
    /// Raw `xport` document for the host at `address`, from `start` (unix seconds).
    fn fetch(&self, address: &str, session: &SessionRef, start: i64) -> Result<String>;
}

/// Fetches `/rrd_updates` from the host over HTTP(S).
pub struct HttpRrdSource {
    client: reqwest::blocking::Client,
    use_https: bool,
}

impl HttpRrdSource {
    pub fn new(settings: &StatsSettings) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            // Hosts present self-signed certificates.
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            client,
            use_https: settings.use_https,
        })
    }

    pub fn url(&self, address: &str) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{}://{}/rrd_updates", scheme, address)
    }
}

impl RrdSource for HttpRrdSource {
    fn fetch(&self, address: &str, session: &SessionRef, start: i64) -> Result<String> {
        let response = self
            .client
            .get(self.url(address))
            .query(&[
                ("session_id", session.as_str()),
                ("start", &start.to_string()),
                ("cf", "AVERAGE"),
                ("interval", "60"),
                ("host", "true"),
            ])
            .send()?
            .error_for_status()?;
        Ok(response.text()?)
    }
}

/// Fetch and parse the last `window` of updates for the connection's host.
pub fn collect(conn: &Connection, source: &dyn RrdSource, window: Duration) -> Result<RrdUpdates> {
    let start = chrono::Utc::now().timestamp() - window.as_secs() as i64;
    let address = conn.identity().address.clone();
    let xml = conn.call("rrd_updates", |_, session| source.fetch(&address, session, start))?;
    RrdUpdates::parse(&xml)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Host,
    Vm,
}

/// One legend entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RrdColumn {
    pub cf: String,
    pub kind: ObjectKind,
    pub uuid: String,
    pub param: String,
}

impl RrdColumn {
    pub fn parse(entry: &str) -> Result<Self> {
        let mut parts = entry.splitn(4, ':');
        let (Some(cf), Some(kind), Some(uuid), Some(param)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Stats(format!("malformed legend entry: {}", entry)));
        };
        let kind = match kind {
            "host" => ObjectKind::Host,
            "vm" => ObjectKind::Vm,
            other => return Err(Error::Stats(format!("unknown object kind {} in {}", other, entry))),
        };
        Ok(Self {
            cf: cf.to_string(),
            kind,
            uuid: uuid.to_string(),
            param: param.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RrdRow {
    pub timestamp: i64,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RrdUpdates {
    pub start: i64,
    pub end: i64,
    pub step: u64,
    pub columns: Vec<RrdColumn>,
    pub rows: Vec<RrdRow>,
}

fn parse_number<T: std::str::FromStr>(tag: &str, text: &str) -> Result<T> {
    text.trim()
        .parse()
        .map_err(|_| Error::Stats(format!("invalid <{}> value: {}", tag, text)))
}

impl RrdUpdates {
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut updates = RrdUpdates::default();
        let mut path: Vec<String> = Vec::new();
        let mut row: Option<RrdRow> = None;

        loop {
            match reader.read_event().map_err(|e| Error::Stats(e.to_string()))? {
                Event::Start(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    if name == "row" {
                        row = Some(RrdRow {
                            timestamp: 0,
                            values: Vec::new(),
                        });
                    }
                    path.push(name);
                }
                Event::End(_) => {
                    if path.pop().as_deref() == Some("row") {
                        if let Some(done) = row.take() {
                            updates.rows.push(done);
                        }
                    }
                }
                Event::Text(t) => {
                    let text = t.unescape().map_err(|e| Error::Stats(e.to_string()))?;
                    match path.last().map(String::as_str) {
                        Some("entry") => updates.columns.push(RrdColumn::parse(&text)?),
                        Some("start") => updates.start = parse_number("start", &text)?,
                        Some("end") => updates.end = parse_number("end", &text)?,
                        Some("step") => updates.step = parse_number("step", &text)?,
                        Some("t") => {
                            if let Some(row) = row.as_mut() {
                                row.timestamp = parse_number("t", &text)?;
                            }
                        }
                        Some("v") => {
                            if let Some(row) = row.as_mut() {
                                row.values.push(parse_number("v", &text)?);
                            }
                        }
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        for (i, r) in updates.rows.iter().enumerate() {
            if r.values.len() != updates.columns.len() {
                return Err(Error::Stats(format!(
                    "row {} has {} values for {} columns",
                    i,
                    r.values.len(),
                    updates.columns.len()
                )));
            }
        }
        Ok(updates)
    }

    /// Mean of a column over all rows, skipping NaN samples.
    pub fn average(&self, column: usize) -> Option<f64> {
        let samples: Vec<f64> = self
            .rows
            .iter()
            .filter_map(|r| r.values.get(column).copied())
            .filter(|v| !v.is_nan())
            .collect();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    fn columns_of<'a>(
        &'a self,
        kind: ObjectKind,
        uuid: &'a str,
    ) -> impl Iterator<Item = (usize, &'a RrdColumn)> + 'a {
        self.columns
            .iter()
            .enumerate()
            .filter(move |(_, c)| c.kind == kind && c.uuid == uuid)
    }

    /// Averages of every column of `uuid` whose parameter satisfies `pred`.
    fn averages_where(&self, kind: ObjectKind, uuid: &str, pred: impl Fn(&str) -> bool) -> Vec<f64> {
        self.columns_of(kind, uuid)
            .filter(|(_, c)| pred(&c.param))
            .filter_map(|(i, _)| self.average(i))
            .collect()
    }

    fn param(&self, kind: ObjectKind, uuid: &str, param: &str) -> f64 {
        self.averages_where(kind, uuid, |p| p == param)
            .first()
            .copied()
            .unwrap_or(0.0)
    }

    pub fn has_object(&self, kind: ObjectKind, uuid: &str) -> bool {
        self.columns_of(kind, uuid).next().is_some()
    }

    pub fn host_stats(&self, uuid: &str) -> Result<HostStats> {
        if !self.has_object(ObjectKind::Host, uuid) {
            return Err(Error::not_found("host statistics", uuid));
        }
        let cpus = self.averages_where(ObjectKind::Host, uuid, is_cpu);
        Ok(HostStats {
            cpu_utilization: percent(&cpus),
            num_cpus: cpus.len() as u32,
            total_memory_kib: self.param(ObjectKind::Host, uuid, "memory_total_kib"),
            free_memory_kib: self.param(ObjectKind::Host, uuid, "memory_free_kib"),
            network_rx_kbs: kib(self.averages_where(ObjectKind::Host, uuid, |p| {
                p.starts_with("pif_") && p.ends_with("_rx")
            })),
            network_tx_kbs: kib(self.averages_where(ObjectKind::Host, uuid, |p| {
                p.starts_with("pif_") && p.ends_with("_tx")
            })),
        })
    }

    pub fn vm_stats(&self, uuid: &str) -> Result<VmStats> {
        if !self.has_object(ObjectKind::Vm, uuid) {
            return Err(Error::not_found("VM statistics", uuid));
        }
        let cpus = self.averages_where(ObjectKind::Vm, uuid, is_cpu);
        Ok(VmStats {
            cpu_utilization: percent(&cpus),
            num_cpus: cpus.len() as u32,
            memory_kib: self.param(ObjectKind::Vm, uuid, "memory") / 1024.0,
            internal_free_kib: self.param(ObjectKind::Vm, uuid, "memory_internal_free"),
            network_read_kbs: kib(self.averages_where(ObjectKind::Vm, uuid, |p| {
                p.starts_with("vif_") && p.ends_with("_rx")
            })),
            network_write_kbs: kib(self.averages_where(ObjectKind::Vm, uuid, |p| {
                p.starts_with("vif_") && p.ends_with("_tx")
            })),
            disk_read_kbs: kib(self.averages_where(ObjectKind::Vm, uuid, |p| {
                p.starts_with("vbd_") && p.ends_with("_read")
            })),
            disk_write_kbs: kib(self.averages_where(ObjectKind::Vm, uuid, |p| {
                p.starts_with("vbd_") && p.ends_with("_write")
            })),
        })
    }
}

fn is_cpu(param: &str) -> bool {
    param
        .strip_prefix("cpu")
        .map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

fn percent(per_cpu: &[f64]) -> f64 {
    if per_cpu.is_empty() {
        return 0.0;
    }
    per_cpu.iter().sum::<f64>() / per_cpu.len() as f64 * 100.0
}

/// Bytes per second summed over devices, in KiB/s.
fn kib(per_device: Vec<f64>) -> f64 {
    per_device.iter().sum::<f64>() / 1024.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStats {
    pub cpu_utilization: f64,
    pub num_cpus: u32,
    pub total_memory_kib: f64,
    pub free_memory_kib: f64,
    pub network_rx_kbs: f64,
    pub network_tx_kbs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmStats {
    pub cpu_utilization: f64,
    pub num_cpus: u32,
    pub memory_kib: f64,
    pub internal_free_kib: f64,
    pub network_read_kbs: f64,
    pub network_write_kbs: f64,
    pub disk_read_kbs: f64,
    pub disk_write_kbs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    const EXPORT: &str = r#"<xport>
      <meta>
        <start>1000</start><step>60</step><end>1120</end><rows>3</rows><columns>5</columns>
        <legend>
          <entry>AVERAGE:host:h1:cpu0</entry>
          <entry>AVERAGE:host:h1:cpu1</entry>
          <entry>AVERAGE:host:h1:memory_total_kib</entry>
          <entry>AVERAGE:vm:v1:cpu0</entry>
          <entry>AVERAGE:vm:v1:vif_0_rx</entry>
        </legend>
      </meta>
      <data>
        <row><t>1120</t><v>0.5</v><v>0.1</v><v>1048576</v><v>0.2</v><v>2048</v></row>
        <row><t>1060</t><v>0.3</v><v>NaN</v><v>1048576</v><v>0.4</v><v>1024</v></row>
        <row><t>1000</t><v>NaN</v><v>0.3</v><v>1048576</v><v>NaN</v><v>NaN</v></row>
      </data>
    </xport>"#;

    #[test]
    fn test_parse_legend_and_rows() {
        let updates = RrdUpdates::parse(EXPORT).unwrap();
        assert_eq!(updates.start, 1000);
        assert_eq!(updates.step, 60);
        assert_eq!(updates.columns.len(), 5);
        assert_eq!(updates.rows.len(), 3);
        assert_eq!(updates.rows[0].timestamp, 1120);
        assert_eq!(updates.columns[3].kind, ObjectKind::Vm);
        assert_eq!(updates.columns[3].param, "cpu0");
    }

    #[test]
    fn test_average_skips_nan() {
        let updates = RrdUpdates::parse(EXPORT).unwrap();
        assert!((updates.average(0).unwrap() - 0.4).abs() < 1e-9);
        assert!((updates.average(1).unwrap() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_all_nan_column_has_no_average() {
        let xml = "<xport><meta><legend><entry>AVERAGE:host:h:cpu0</entry></legend></meta>\
                   <data><row><t>1</t><v>NaN</v></row></data></xport>";
        let updates = RrdUpdates::parse(xml).unwrap();
        assert_eq!(updates.average(0), None);
        assert_eq!(updates.host_stats("h").unwrap().cpu_utilization, 0.0);
    }

    #[test]
    fn test_host_and_vm_stats() {
        let updates = RrdUpdates::parse(EXPORT).unwrap();
        let host = updates.host_stats("h1").unwrap();
        assert_eq!(host.num_cpus, 2);
        assert!((host.cpu_utilization - 30.0).abs() < 1e-9);
        assert_eq!(host.total_memory_kib, 1048576.0);

        let vm = updates.vm_stats("v1").unwrap();
        assert!((vm.cpu_utilization - 30.0).abs() < 1e-9);
        assert!((vm.network_read_kbs - 1.5).abs() < 1e-9);
        assert!(matches!(updates.vm_stats("v2"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_malformed_legend_rejected() {
        assert!(RrdColumn::parse("AVERAGE:host:only").is_err());
        assert!(RrdColumn::parse("AVERAGE:sr:u:p").is_err());
        let ragged = "<xport><meta><legend><entry>AVERAGE:host:h:cpu0</entry></legend></meta>\
                      <data><row><t>1</t><v>1</v><v>2</v></row></data></xport>";
        assert!(RrdUpdates::parse(ragged).is_err());
    }

    #[test]
    fn test_http_source_url() {
        let source = HttpRrdSource::new(&StatsSettings::default()).unwrap();
        assert_eq!(source.url("10.0.0.1"), "https://10.0.0.1/rrd_updates");
        let plain = HttpRrdSource::new(&StatsSettings {
            use_https: false,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(plain.url("10.0.0.1"), "http://10.0.0.1/rrd_updates");
    }

    #[test]
    fn test_collect_from_simulated_pool() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let updates = collect(&conn, &fx.sim, Duration::from_secs(60)).unwrap();
        let host = updates.host_stats("host-1").unwrap();
        assert!((host.cpu_utilization - 50.0).abs() < 1e-9);
        assert!((host.network_rx_kbs - 2.0).abs() < 1e-9);
    }
}
