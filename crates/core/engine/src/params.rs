use hashbrown::HashMap;

use crate::error::ConfigError;

/// The two device archetypes this engine models. See spec.md §1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SimulationKind {
    Transistor,
    SolarCell,
}

impl SimulationKind {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "transistor" => Ok(SimulationKind::Transistor),
            "solarcell" => Ok(SimulationKind::SolarCell),
            other => Err(ConfigError::UnknownSimulationKind(other.to_string())),
        }
    }
}

/// A typed, validated configuration record. Parsing the `key = value` text
/// format and wiring it from a CLI is an external collaborator's job per
/// spec.md §1; this type, its parser, and its validation rules are the part
/// of the contract the core owns (spec.md §4.7: "Rates and percentages are
/// validated at construction; invalid values fail fast with a diagnostic
/// naming the offending key").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Parameters {
    pub grid_x: u32,
    pub grid_y: u32,
    pub grid_z: u32,

    pub simulation_kind: SimulationKind,
    pub iterations_real: u64,
    pub iterations_print: u64,
    pub random_seed: u64,

    pub electron_percentage: f64,
    pub hole_percentage: f64,
    pub defect_percentage: f64,
    pub trap_percentage: f64,
    pub seed_percentage: f64,
    /// Fraction (`[0,1]`) of `max_electrons`/`max_holes` to pre-seed at
    /// construction, before any tick runs. See `original_source/world.cpp`
    /// `placeElectrons`/`placeHoles` (`maxSeeded = max * seedCharges`).
    pub seed_charges: f64,

    pub voltage_left: f64,
    pub voltage_right: f64,
    pub slope_z: f64,
    pub trap_potential: f64,
    pub gaussian_stdev: f64,
    pub gaussian_average: f64,

    pub temperature_kelvin: f64,
    pub dielectric_constant: f64,
    pub grid_factor: f64,

    pub source_rate: f64,
    pub drain_rate: f64,
    pub recombination_rate: f64,
    pub generation_rate: f64,
    pub e_source_l_rate: Option<f64>,
    pub e_source_r_rate: Option<f64>,
    pub h_source_l_rate: Option<f64>,
    pub h_source_r_rate: Option<f64>,
    pub e_drain_l_rate: Option<f64>,
    pub e_drain_r_rate: Option<f64>,
    pub h_drain_l_rate: Option<f64>,
    pub h_drain_r_rate: Option<f64>,

    pub coulomb_carriers: bool,
    pub defects_charge: i32,
    pub electrostatic_cutoff: u32,
    pub coulomb_gaussian_sigma: f64,
    pub exciton_binding: f64,
    pub hopping_range: u8,

    pub use_opencl: bool,
    pub work_x: u32,
    pub work_y: u32,
    pub work_z: u32,
    pub work_size: u32,

    /// Keys this crate does not interpret (`output.*`, `image.*`,
    /// `output.stub`, `output.path`), owned by the logging/image writers
    /// that spec.md §1 names as external collaborators. Carried through
    /// unparsed so a checkpoint round-trip preserves them.
    pub passthrough: HashMap<String, String>,
}

impl Parameters {
    /// Parse the `[Parameters]` section body (one `key = value` line per
    /// entry, `#` introduces a trailing comment, blank lines ignored).
    pub fn parse(body: &str) -> Result<Self, ConfigError> {
        let mut raw: HashMap<String, String> = HashMap::new();
        for line in body.lines() {
            let line = match line.find('#') {
                Some(idx) => &line[..idx],
                None => line,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| ConfigError::MissingEquals(line.to_string()))?;
            raw.insert(key.trim().to_string(), value.trim().to_string());
        }
        Self::from_map(raw)
    }

    fn from_map(mut raw: HashMap<String, String>) -> Result<Self, ConfigError> {
        macro_rules! required {
            ($key:literal) => {
                raw.remove($key).ok_or(ConfigError::MissingKey($key))?
            };
        }
        macro_rules! parse_as {
            ($key:literal, $value:expr, $ty:ty, $label:literal) => {
                $value.parse::<$ty>().map_err(|_| ConfigError::BadValue {
                    key: $key.to_string(),
                    value: $value.clone(),
                    expected: $label,
                })?
            };
        }
        macro_rules! field {
            ($key:literal, $ty:ty, $label:literal) => {{
                let v = required!($key);
                parse_as!($key, v, $ty, $label)
            }};
        }
        macro_rules! optional_field {
            ($key:literal, $ty:ty, $label:literal) => {
                match raw.remove($key) {
                    Some(v) => Some(parse_as!($key, v, $ty, $label)),
                    None => None,
                }
            };
        }

        let params = Parameters {
            grid_x: field!("grid.x", u32, "an integer"),
            grid_y: field!("grid.y", u32, "an integer"),
            grid_z: field!("grid.z", u32, "an integer"),

            simulation_kind: SimulationKind::parse(&required!("simulation.type"))?,
            iterations_real: field!("iterations.real", u64, "an integer"),
            iterations_print: field!("iterations.print", u64, "an integer"),
            random_seed: field!("random.seed", u64, "an integer"),

            electron_percentage: field!("electron.percentage", f64, "a float"),
            hole_percentage: field!("hole.percentage", f64, "a float"),
            defect_percentage: field!("defect.percentage", f64, "a float"),
            trap_percentage: field!("trap.percentage", f64, "a float"),
            seed_percentage: field!("seed.percentage", f64, "a float"),
            seed_charges: field!("seed.charges", f64, "a float"),

            voltage_left: field!("voltage.left", f64, "a float"),
            voltage_right: field!("voltage.right", f64, "a float"),
            slope_z: field!("slope.z", f64, "a float"),
            trap_potential: field!("trap.potential", f64, "a float"),
            gaussian_stdev: field!("gaussian.stdev", f64, "a float"),
            gaussian_average: field!("gaussian.average", f64, "a float"),

            temperature_kelvin: field!("temperature.kelvin", f64, "a float"),
            dielectric_constant: field!("dielectric.constant", f64, "a float"),
            grid_factor: field!("grid.factor", f64, "a float"),

            source_rate: field!("source.rate", f64, "a float"),
            drain_rate: field!("drain.rate", f64, "a float"),
            recombination_rate: field!("recombination.rate", f64, "a float"),
            generation_rate: field!("generation.rate", f64, "a float"),
            e_source_l_rate: optional_field!("e.source.l.rate", f64, "a float"),
            e_source_r_rate: optional_field!("e.source.r.rate", f64, "a float"),
            h_source_l_rate: optional_field!("h.source.l.rate", f64, "a float"),
            h_source_r_rate: optional_field!("h.source.r.rate", f64, "a float"),
            e_drain_l_rate: optional_field!("e.drain.l.rate", f64, "a float"),
            e_drain_r_rate: optional_field!("e.drain.r.rate", f64, "a float"),
            h_drain_l_rate: optional_field!("h.drain.l.rate", f64, "a float"),
            h_drain_r_rate: optional_field!("h.drain.r.rate", f64, "a float"),

            coulomb_carriers: field!("coulomb.carriers", bool, "true or false"),
            defects_charge: field!("defects.charge", i32, "an integer"),
            electrostatic_cutoff: field!("electrostatic.cutoff", u32, "an integer"),
            coulomb_gaussian_sigma: field!("coulomb.gaussian.sigma", f64, "a float"),
            exciton_binding: field!("exciton.binding", f64, "a float"),
            hopping_range: field!("hopping.range", u8, "1 or 2"),

            use_opencl: field!("use.opencl", bool, "true or false"),
            work_x: field!("work.x", u32, "an integer"),
            work_y: field!("work.y", u32, "an integer"),
            work_z: field!("work.z", u32, "an integer"),
            work_size: field!("work.size", u32, "an integer"),

            passthrough: Self::take_known_passthrough(&mut raw),
        };
        if let Some(key) = raw.keys().next() {
            return Err(ConfigError::UnknownKey(key.clone()));
        }
        params.validate()?;
        Ok(params)
    }

    /// Remove and return every key the core itself doesn't interpret but
    /// spec.md §1 names as belonging to an external collaborator
    /// (`output.*`, `image.*`, which subsume `output.stub`/`output.path`).
    /// Anything left over in `raw` after this is a genuine typo or
    /// unsupported key, not a passthrough one, and `from_map` reports it as
    /// `ConfigError::UnknownKey`.
    fn take_known_passthrough(raw: &mut HashMap<String, String>) -> HashMap<String, String> {
        let keys: Vec<String> = raw
            .keys()
            .filter(|k| k.starts_with("output.") || k.starts_with("image."))
            .cloned()
            .collect();
        keys.into_iter().map(|k| (k.clone(), raw.remove(&k).expect("key just listed"))).collect()
    }

    /// Re-validate an already-constructed record, e.g. after loading one
    /// from a checkpoint. See spec.md §7 "Configuration" error kind.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("electron.percentage", self.electron_percentage),
            ("hole.percentage", self.hole_percentage),
            ("defect.percentage", self.defect_percentage),
            ("trap.percentage", self.trap_percentage),
            ("seed.percentage", self.seed_percentage),
            ("seed.charges", self.seed_charges),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::PercentageOutOfRange { key: key.to_string(), value });
            }
        }
        if self.iterations_print == 0 || self.iterations_real % self.iterations_print != 0 {
            return Err(ConfigError::IterationsNotDivisible {
                real: self.iterations_real,
                print: self.iterations_print,
            });
        }
        let sum = self.defect_percentage + self.trap_percentage;
        if sum > 1.0 {
            return Err(ConfigError::DefectTrapOverflow { sum });
        }
        if self.hopping_range != 1 && self.hopping_range != 2 {
            return Err(ConfigError::BadValue {
                key: "hopping.range".to_string(),
                value: self.hopping_range.to_string(),
                expected: "1 or 2",
            });
        }
        if self.temperature_kelvin < 0.0 {
            return Err(ConfigError::BadValue {
                key: "temperature.kelvin".to_string(),
                value: self.temperature_kelvin.to_string(),
                expected: "a non-negative float",
            });
        }
        Ok(())
    }

    pub fn max_electrons(&self) -> u32 {
        ((self.grid_x * self.grid_y * self.grid_z) as f64 * self.electron_percentage) as u32
    }

    pub fn max_holes(&self) -> u32 {
        ((self.grid_x * self.grid_y * self.grid_z) as f64 * self.hole_percentage) as u32
    }

    /// Render the `[Parameters]` section body in a fixed key order (the
    /// enumerated key set of spec.md §6, passthrough keys last, sorted),
    /// inverse of `parse`. Used by the checkpointer; the fixed order is what
    /// makes `save → load → save` byte-identical (spec.md §8 property 6).
    pub fn to_body(&self) -> String {
        let kind = match self.simulation_kind {
            SimulationKind::Transistor => "transistor",
            SimulationKind::SolarCell => "solarcell",
        };
        let mut out = String::new();
        macro_rules! line {
            ($key:literal, $value:expr) => {
                out.push_str(&format!("{} = {}\n", $key, $value))
            };
        }
        macro_rules! optional_line {
            ($key:literal, $value:expr) => {
                if let Some(v) = $value {
                    out.push_str(&format!("{} = {}\n", $key, v))
                }
            };
        }

        line!("grid.x", self.grid_x);
        line!("grid.y", self.grid_y);
        line!("grid.z", self.grid_z);
        line!("simulation.type", kind);
        line!("iterations.real", self.iterations_real);
        line!("iterations.print", self.iterations_print);
        line!("random.seed", self.random_seed);
        line!("electron.percentage", self.electron_percentage);
        line!("hole.percentage", self.hole_percentage);
        line!("defect.percentage", self.defect_percentage);
        line!("trap.percentage", self.trap_percentage);
        line!("seed.percentage", self.seed_percentage);
        line!("seed.charges", self.seed_charges);
        line!("voltage.left", self.voltage_left);
        line!("voltage.right", self.voltage_right);
        line!("slope.z", self.slope_z);
        line!("trap.potential", self.trap_potential);
        line!("gaussian.stdev", self.gaussian_stdev);
        line!("gaussian.average", self.gaussian_average);
        line!("temperature.kelvin", self.temperature_kelvin);
        line!("dielectric.constant", self.dielectric_constant);
        line!("grid.factor", self.grid_factor);
        line!("source.rate", self.source_rate);
        line!("drain.rate", self.drain_rate);
        line!("recombination.rate", self.recombination_rate);
        line!("generation.rate", self.generation_rate);
        optional_line!("e.source.l.rate", self.e_source_l_rate);
        optional_line!("e.source.r.rate", self.e_source_r_rate);
        optional_line!("h.source.l.rate", self.h_source_l_rate);
        optional_line!("h.source.r.rate", self.h_source_r_rate);
        optional_line!("e.drain.l.rate", self.e_drain_l_rate);
        optional_line!("e.drain.r.rate", self.e_drain_r_rate);
        optional_line!("h.drain.l.rate", self.h_drain_l_rate);
        optional_line!("h.drain.r.rate", self.h_drain_r_rate);
        line!("coulomb.carriers", self.coulomb_carriers);
        line!("defects.charge", self.defects_charge);
        line!("electrostatic.cutoff", self.electrostatic_cutoff);
        line!("coulomb.gaussian.sigma", self.coulomb_gaussian_sigma);
        line!("exciton.binding", self.exciton_binding);
        line!("hopping.range", self.hopping_range);
        line!("use.opencl", self.use_opencl);
        line!("work.x", self.work_x);
        line!("work.y", self.work_y);
        line!("work.z", self.work_z);
        line!("work.size", self.work_size);

        let mut passthrough: Vec<(&String, &String)> = self.passthrough.iter().collect();
        passthrough.sort_unstable_by(|a, b| a.0.cmp(b.0));
        for (key, value) in passthrough {
            out.push_str(&format!("{key} = {value}\n"));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_body() -> String {
        "\
grid.x = 4\ngrid.y = 4\ngrid.z = 1\n\
simulation.type = transistor\n\
iterations.real = 100\niterations.print = 10\nrandom.seed = 1\n\
electron.percentage = 0.1\nhole.percentage = 0.0\n\
defect.percentage = 0.0\ntrap.percentage = 0.0\nseed.percentage = 1.0\nseed.charges = 0\n\
voltage.left = 0\nvoltage.right = 1\nslope.z = 0\ntrap.potential = 0\n\
gaussian.stdev = 0\ngaussian.average = 0\n\
temperature.kelvin = 300\ndielectric.constant = 3.5\ngrid.factor = 1e-9\

source.rate = 1\ndrain.rate = 1\nrecombination.rate = 1\ngeneration.rate = 0\n\
coulomb.carriers = false\ndefects.charge = 0\nelectrostatic.cutoff = 3\n\
coulomb.gaussian.sigma = 1\nexciton.binding = 0\nhopping.range = 1\n\
use.opencl = false\nwork.x = 0\nwork.y = 0\nwork.z = 0\nwork.size = 0\n\
"
        .to_string()
    }

    #[test]
    fn parses_minimal_valid_body() {
        let params = Parameters::parse(&minimal_body()).unwrap();
        assert_eq!(params.grid_x, 4);
        assert_eq!(params.simulation_kind, SimulationKind::Transistor);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let mut body = minimal_body();
        body.push_str("# a trailing comment line\n\n");
        assert!(Parameters::parse(&body).is_ok());
    }

    #[test]
    fn rejects_percentage_out_of_range() {
        let body = minimal_body().replace("electron.percentage = 0.1", "electron.percentage = 1.5");
        assert!(matches!(
            Parameters::parse(&body),
            Err(ConfigError::PercentageOutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_non_divisible_iterations() {
        let body = minimal_body().replace("iterations.real = 100", "iterations.real = 101");
        assert!(matches!(
            Parameters::parse(&body),
            Err(ConfigError::IterationsNotDivisible { .. })
        ));
    }

    #[test]
    fn rejects_unknown_simulation_type() {
        let body = minimal_body().replace("simulation.type = transistor", "simulation.type = bogus");
        assert!(matches!(
            Parameters::parse(&body),
            Err(ConfigError::UnknownSimulationKind(_))
        ));
    }

    #[test]
    fn rejects_unknown_key() {
        let mut body = minimal_body();
        body.push_str("votlage.left = 3\n");
        assert!(matches!(Parameters::parse(&body), Err(ConfigError::UnknownKey(_))));
    }

    #[test]
    fn output_and_image_keys_pass_through() {
        let mut body = minimal_body();
        body.push_str("output.stub = run1\noutput.path = /tmp/out\nimage.width = 64\n");
        let params = Parameters::parse(&body).unwrap();
        assert_eq!(params.passthrough.get("output.stub").map(String::as_str), Some("run1"));
        assert_eq!(params.passthrough.get("image.width").map(String::as_str), Some("64"));
    }

    #[test]
    fn rejects_missing_equals() {
        let mut body = minimal_body();
        body.push_str("not-a-kv-line\n");
        assert!(matches!(Parameters::parse(&body), Err(ConfigError::MissingEquals(_))));
    }

    #[test]
    fn to_body_round_trips_through_parse() {
        let params = Parameters::parse(&minimal_body()).unwrap();
        let rendered = params.to_body();
        let reparsed = Parameters::parse(&rendered).unwrap();
        assert_eq!(reparsed.grid_x, params.grid_x);
        assert_eq!(reparsed.simulation_kind, params.simulation_kind);
        assert_eq!(reparsed.to_body(), rendered);
    }
}
