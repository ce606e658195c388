use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

/// A single analog channel.
pub trait AnalogInput: Send {
    fn read(&mut self) -> io::Result<u16>;
}

/// Raw ADC value from an IIO `in_voltageN_raw` attribute.
#[derive(Debug)]
pub struct IioInput {
    path: PathBuf,
}

impl IioInput {
    pub fn open(path: &Path) -> io::Result<Self> {
        std::fs::metadata(path)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl AnalogInput for IioInput {
    fn read(&mut self) -> io::Result<u16> {
        std::fs::read_to_string(&self.path)?
            .trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Hall-effect presence sensor.
///
/// The field at start-up is taken as the baseline; the sensor is active
/// while the reading is at least `threshold` away from it in either
/// direction.
pub struct HallSensor<I> {
    input: I,
    threshold: u16,
    baseline: u16,
    active: bool,
    reported: bool,
}

impl<I: AnalogInput> HallSensor<I> {
    pub fn new(mut input: I, threshold: u16) -> io::Result<Self> {
        let baseline = input.read()?;
        info!(baseline, threshold, "hall sensor calibrated");
        Ok(Self {
            input,
            threshold,
            baseline,
            active: false,
            reported: false,
        })
    }

    /// Take one reading.
    pub fn update(&mut self) -> io::Result<()> {
        let value = self.input.read()?;
        self.active = value.abs_diff(self.baseline) >= self.threshold;
        Ok(())
    }

    /// True once per activation, on the first update that sees it.
    pub fn event(&mut self) -> bool {
        let event = self.active && !self.reported;
        if event {
            debug!("hall sensor triggered");
        }
        self.reported = self.active;
        event
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn baseline(&self) -> u16 {
        self.baseline
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays readings, repeating the last one forever.
    pub(crate) struct Readings(pub VecDeque<u16>);

    impl Readings {
        pub(crate) fn of(values: &[u16]) -> Self {
            Self(values.iter().copied().collect())
        }
    }

    impl AnalogInput for Readings {
        fn read(&mut self) -> io::Result<u16> {
            match self.0.len() {
                0 => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no readings")),
                1 => Ok(self.0[0]),
                _ => Ok(self.0.pop_front().unwrap()),
            }
        }
    }

    #[test]
    fn first_reading_is_baseline() {
        let sensor = HallSensor::new(Readings::of(&[2048, 2048]), 1000).unwrap();
        assert_eq!(sensor.baseline(), 2048);
        assert!(!sensor.active());
    }

    #[test]
    fn deviation_either_way_activates() {
        let mut sensor =
            HallSensor::new(Readings::of(&[2000, 2999, 3000, 1000, 999]), 1000).unwrap();
        let mut seen = Vec::new();
        for _ in 0..4 {
            sensor.update().unwrap();
            seen.push(sensor.active());
        }
        assert_eq!(seen, vec![false, true, true, true]);
    }

    #[test]
    fn event_fires_once_per_activation() {
        let mut sensor =
            HallSensor::new(Readings::of(&[0, 1500, 1500, 10, 1500, 10]), 1000).unwrap();
        let mut events = Vec::new();
        for _ in 0..5 {
            sensor.update().unwrap();
            events.push(sensor.event());
        }
        assert_eq!(events, vec![true, false, false, true, false]);
    }

    #[test]
    fn failed_read_is_reported() {
        let mut sensor = HallSensor::new(Readings::of(&[0]), 10).unwrap();
        sensor.input.0.clear();
        assert!(sensor.update().is_err());
    }

    #[test]
    fn iio_input_parses_raw_attribute() {
        let path = std::env::temp_dir().join(format!("portal-iio-{}", std::process::id()));
        std::fs::write(&path, "1234\n").unwrap();

        let mut input = IioInput::open(&path).unwrap();
        assert_eq!(input.read().unwrap(), 1234);

        std::fs::write(&path, "garbage").unwrap();
        assert_eq!(input.read().unwrap_err().kind(), io::ErrorKind::InvalidData);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_iio_attribute_fails_to_open() {
        assert!(IioInput::open(Path::new("/nonexistent/in_voltage0_raw")).is_err());
    }
}
