//! Temperature sensors on the 1-Wire bus, read through the kernel's `w1` sysfs
//! interface.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::{debug, warn};

use crate::{IonoPiError, Result};

/// A 1-Wire bus as exposed by the kernel `w1-gpio` driver.
#[derive(Clone, Debug)]
pub struct OneWireBus {
    root: PathBuf,
}

impl Default for OneWireBus {
    fn default() -> Self {
        Self::with_root(Self::DEVICES_PATH)
    }
}

impl OneWireBus {
    /// Where the kernel lists 1-Wire devices.
    pub const DEVICES_PATH: &'static str = "/sys/bus/w1/devices/";

    /// The bus at [`OneWireBus::DEVICES_PATH`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus whose devices are listed under `root` instead.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        OneWireBus { root: root.into() }
    }

    /// IDs of the devices on the bus, sorted. Bus masters are skipped.
    pub fn devices(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.root).map_err(|e| self.io_error(&self.root, e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.io_error(&self.root, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('w') && !name.starts_with('.') {
                ids.push(name);
            }
        }
        ids.sort();
        debug!("Found {} 1-Wire device(s)", ids.len());
        Ok(ids)
    }

    /// Read a temperature sensor in °C, trying up to `attempts` times.
    ///
    /// A read fails if the sensor reports a bad CRC; the error of the last attempt is
    /// returned.
    pub fn read_temperature(&self, id: &str, attempts: u32) -> Result<f32> {
        let path = self.root.join(id).join("w1_slave");
        let mut result = Err(IonoPiError::OneWireReadError(id.to_string()));
        for attempt in 1..=attempts.max(1) {
            result = fs::read_to_string(&path)
                .map_err(|e| self.io_error(&path, e))
                .and_then(|contents| {
                    parse_w1_slave(&contents)
                        .ok_or_else(|| IonoPiError::OneWireReadError(id.to_string()))
                });
            match &result {
                Ok(celsius) => {
                    debug!("1-Wire {id}: {celsius} °C");
                    break;
                }
                Err(e) => warn!("1-Wire {id}: attempt {attempt} failed: {e}"),
            }
        }
        result
    }

    fn io_error(&self, path: &Path, source: io::Error) -> IonoPiError {
        IonoPiError::OneWireIo {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Parse the contents of a `w1_slave` file:
///
/// ```text
/// 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
/// 72 01 4b 46 7f ff 0e 10 57 t=23125
/// ```
fn parse_w1_slave(contents: &str) -> Option<f32> {
    let mut lines = contents.lines();
    if lines.next()?.trim_end().rsplit(' ').next()? != "YES" {
        return None;
    }
    let (_, millis) = lines.next()?.rsplit_once('=')?;
    let millis: i32 = millis.trim().parse().ok()?;
    Some(millis as f32 / 1000.0)
}

#[cfg(test)]
mod test {
    use super::*;

    const GOOD: &str = "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n\
                        72 01 4b 46 7f ff 0e 10 57 t=23125\n";

    #[test]
    fn parse_good_reading() {
        assert_eq!(parse_w1_slave(GOOD), Some(23.125));
        assert_eq!(
            parse_w1_slave("00 : crc=00 YES\n00 t=-1500\n"),
            Some(-1.5)
        );
    }

    #[test]
    fn parse_bad_readings() {
        assert_eq!(
            parse_w1_slave("72 01 4b 46 7f ff 0e 10 57 : crc=57 NO\n72 01 t=23125\n"),
            None
        );
        assert_eq!(parse_w1_slave("72 01 : crc=57 YES\n"), None);
        assert_eq!(parse_w1_slave("72 01 : crc=57 YES\n72 01 t=abc\n"), None);
        assert_eq!(parse_w1_slave(""), None);
    }

    fn fake_bus(name: &str) -> (PathBuf, OneWireBus) {
        let root = std::env::temp_dir().join(format!("ionopi-w1-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(root.join("w1_bus_master1")).expect("Bad dir");
        fs::create_dir_all(root.join("28-000005e2fdc3")).expect("Bad dir");
        fs::create_dir_all(root.join("28-0000061b2c0e")).expect("Bad dir");
        let bus = OneWireBus::with_root(&root);
        (root, bus)
    }

    #[test]
    fn list_and_read_devices() {
        let (root, bus) = fake_bus("list");
        fs::write(root.join("28-000005e2fdc3").join("w1_slave"), GOOD).expect("Bad write");

        assert_eq!(
            bus.devices().expect("Bad devices"),
            vec!["28-000005e2fdc3", "28-0000061b2c0e"]
        );
        assert_eq!(
            bus.read_temperature("28-000005e2fdc3", 3)
                .expect("Bad temperature"),
            23.125
        );
        match bus.read_temperature("28-0000061b2c0e", 2) {
            Err(IonoPiError::OneWireIo { path, .. }) => assert!(path.ends_with("w1_slave")),
            x => panic!("Unexpected return value: {x:?}"),
        }

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn bad_crc_is_read_error() {
        let (root, bus) = fake_bus("crc");
        fs::write(
            root.join("28-000005e2fdc3").join("w1_slave"),
            "72 01 : crc=57 NO\n72 01 t=23125\n",
        )
        .expect("Bad write");

        match bus.read_temperature("28-000005e2fdc3", 0) {
            Err(IonoPiError::OneWireReadError(id)) => assert_eq!(id, "28-000005e2fdc3"),
            x => panic!("Unexpected return value: {x:?}"),
        }

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn missing_bus_is_io_error() {
        let bus = OneWireBus::with_root("/nonexistent/w1/devices");
        assert!(matches!(bus.devices(), Err(IonoPiError::OneWireIo { .. })));
    }
}
