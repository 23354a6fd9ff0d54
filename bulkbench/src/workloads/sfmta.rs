use serde::Deserialize;
use toml::Table;

use crate::client::ClientProperties;
use crate::db::{Column, ColumnType, Predicate, Row, Schema, Value};
use crate::error::JobError;
use crate::generators::{self, Generator, UniformF32, UniformI32};
use crate::workloads::Workload;
use crate::CoreProperties;

pub static SFMTA_SCHEMA: Schema = Schema::new(&[
    Column {
        name: "report_time",
        ty: ColumnType::Int64,
        nullable: false,
    },
    Column {
        name: "vehicle_tag",
        ty: ColumnType::Int32,
        nullable: true,
    },
    Column {
        name: "longitude",
        ty: ColumnType::Float32,
        nullable: true,
    },
    Column {
        name: "latitude",
        ty: ColumnType::Float32,
        nullable: true,
    },
    Column {
        name: "speed",
        ty: ColumnType::Float32,
        nullable: true,
    },
    Column {
        name: "heading",
        ty: ColumnType::Float32,
        nullable: true,
    },
]);

const METRIC_COLUMN: &str = "speed";
const METRIC_IDX: usize = 4;

/// A vehicle-position report. `report_time` is the primary key.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sfmta {
    pub report_time: i64,
    pub vehicle_tag: i32,
    pub longitude: f32,
    pub latitude: f32,
    pub speed: f32,
    pub heading: f32,
}

impl From<Sfmta> for Row {
    fn from(r: Sfmta) -> Self {
        vec![
            Value::Int64(r.report_time),
            Value::Int32(r.vehicle_tag),
            Value::Float32(r.longitude),
            Value::Float32(r.latitude),
            Value::Float32(r.speed),
            Value::Float32(r.heading),
        ]
    }
}

pub struct SfmtaWorkload {
    props: Properties,

    tag_generator: UniformI32,
    position_generator: UniformF32,
    metric_generator: Box<dyn Generator<f32>>,
}

impl Workload for SfmtaWorkload {
    fn new(_: &CoreProperties, _: &ClientProperties, props: &Table) -> Result<Self, JobError> {
        let props: Properties = props.clone().try_into()?;
        if props.seed_value.to_bits() == props.target_value.to_bits() {
            return Err(JobError::Config(format!(
                "seedvalue and targetvalue are both {}",
                props.seed_value
            )));
        }
        let position_generator = UniformF32::new(props.extreme_proportion).ok_or_else(|| {
            JobError::Config(format!(
                "extremeproportion {} is outside [0, 1]",
                props.extreme_proportion
            ))
        })?;
        let metric_generator: Box<dyn Generator<f32>> = match &*props.metric_distribution {
            "constant" => Box::new(generators::Constant::new(props.seed_value)),
            "uniform" => Box::new(UniformF32::new(props.extreme_proportion).ok_or_else(|| {
                JobError::Config("invalid extremeproportion".to_string())
            })?),
            other => {
                return Err(JobError::Config(format!(
                    "invalid metricdistribution: {}",
                    other
                )));
            }
        };
        Ok(SfmtaWorkload {
            props,
            tag_generator: UniformI32,
            position_generator,
            metric_generator,
        })
    }

    fn table(&self) -> &str {
        &self.props.table
    }

    fn schema(&self) -> &'static Schema {
        &SFMTA_SCHEMA
    }

    fn build_row(&self, key: i64) -> Row {
        self.build_record(key).into()
    }

    fn seed_predicate(&self) -> Predicate {
        Predicate::eq(METRIC_COLUMN, Value::Float32(self.props.seed_value))
    }

    fn seeded(&self) -> bool {
        self.props.metric_distribution == "constant"
    }

    fn target_predicate(&self) -> Predicate {
        Predicate::eq(METRIC_COLUMN, Value::Float32(self.props.target_value))
    }

    fn transform(&self, row: &Row) -> Result<Row, JobError> {
        if row.len() != SFMTA_SCHEMA.width() {
            return Err(JobError::RowShape {
                expected: SFMTA_SCHEMA.width(),
                actual: row.len(),
            });
        }
        let mut ret = row.clone();
        ret[METRIC_IDX] = Value::Float32(self.props.target_value);
        Ok(ret)
    }
}

impl SfmtaWorkload {
    pub fn build_record(&self, key: i64) -> Sfmta {
        Sfmta {
            report_time: key,
            vehicle_tag: self.tag_generator.next(),
            longitude: self.position_generator.next(),
            latitude: self.position_generator.next(),
            speed: self.metric_generator.next(),
            heading: self.position_generator.next(),
        }
    }
}

#[derive(Deserialize, Debug)]
struct Properties {
    #[serde(default = "default_table")]
    table: String,

    #[serde(
        rename = "metricdistribution",
        default = "default_metric_distribution"
    )]
    metric_distribution: String,

    #[serde(rename = "seedvalue", default = "default_seed_value")]
    seed_value: f32,

    #[serde(rename = "targetvalue", default = "default_target_value")]
    target_value: f32,

    #[serde(rename = "extremeproportion", default = "default_extreme_proportion")]
    extreme_proportion: f64,
}

fn default_table() -> String {
    "sfmta".to_string()
}
fn default_metric_distribution() -> String {
    "constant".to_string()
}
fn default_seed_value() -> f32 {
    4.0
}
fn default_target_value() -> f32 {
    10.0
}
fn default_extreme_proportion() -> f64 {
    0.01
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::rows_bit_eq;
    use crate::workloads::{records, KeyRange};

    fn workload(overrides: &[(&str, toml::Value)]) -> Result<SfmtaWorkload, JobError> {
        let mut props = Table::new();
        props.insert("recordcount".to_string(), toml::Value::from(1));
        for (k, v) in overrides {
            props.insert(k.to_string(), v.clone());
        }
        let core_props: CoreProperties = props.clone().try_into()?;
        let client_props = ClientProperties::parse(props.clone())?;
        SfmtaWorkload::new(&core_props, &client_props, &props)
    }

    #[test]
    fn records_carry_the_seed_metric() {
        let w = workload(&[]).unwrap();
        assert!(w.seeded());
        let range = KeyRange::new(100, 500).unwrap();
        let rows: Vec<Row> = records(&w, range).collect();
        assert_eq!(rows.len(), 500);
        for (row, key) in rows.iter().zip(range.keys()) {
            assert_eq!(row[0], Value::Int64(key));
            assert_eq!(row[METRIC_IDX], Value::Float32(4.0));
            SFMTA_SCHEMA.check(row).unwrap();
        }
    }

    #[test]
    fn uniform_metric_is_not_fixed() {
        let w = workload(&[
            ("metricdistribution", toml::Value::from("uniform")),
            ("extremeproportion", toml::Value::from(0.0)),
        ])
        .unwrap();
        assert!(!w.seeded());
        let matching = (0..200)
            .filter(|k| w.build_record(*k).speed == 4.0)
            .count();
        assert!(matching < 200);
    }

    #[test]
    fn transform_rewrites_only_the_metric() {
        let w = workload(&[("extremeproportion", toml::Value::from(0.5))]).unwrap();
        for key in 0..1_000 {
            let original = w.build_row(key);
            let updated = w.transform(&original).unwrap();
            assert_eq!(updated.len(), original.len());
            for (i, (before, after)) in original.iter().zip(&updated).enumerate() {
                if i == METRIC_IDX {
                    assert_eq!(*after, Value::Float32(10.0));
                } else {
                    assert!(before.bit_eq(after), "column {} changed", i);
                }
            }
        }
    }

    #[test]
    fn transform_is_idempotent_and_keeps_nulls() {
        let w = workload(&[]).unwrap();
        let mut row = w.build_row(7);
        row[1] = Value::Null;
        let once = w.transform(&row).unwrap();
        let twice = w.transform(&once).unwrap();
        assert!(rows_bit_eq(&once, &twice));
        assert_eq!(once[1], Value::Null);
    }

    #[test]
    fn transform_rejects_wrong_width() {
        let w = workload(&[]).unwrap();
        let mut row = w.build_row(1);
        row.push(Value::Null);
        assert!(matches!(
            w.transform(&row),
            Err(JobError::RowShape {
                expected: 6,
                actual: 7
            })
        ));
    }

    #[test]
    fn rejects_bad_configuration() {
        assert!(matches!(
            workload(&[("targetvalue", toml::Value::from(4))]),
            Err(JobError::Config(_))
        ));
        assert!(matches!(
            workload(&[("metricdistribution", toml::Value::from("zipfian"))]),
            Err(JobError::Config(_))
        ));
        assert!(matches!(
            workload(&[("extremeproportion", toml::Value::from(2.0))]),
            Err(JobError::Config(_))
        ));
        assert!(matches!(
            workload(&[("seedvalue", toml::Value::from("four"))]),
            Err(JobError::Config(_))
        ));
    }

    #[test]
    fn predicates_target_the_metric_column() {
        let w = workload(&[("seedvalue", toml::Value::from(1.5))]).unwrap();
        assert_eq!(
            w.seed_predicate(),
            Predicate::eq("speed", Value::Float32(1.5))
        );
        assert_eq!(
            w.target_predicate(),
            Predicate::eq("speed", Value::Float32(10.0))
        );
        assert_eq!(SFMTA_SCHEMA.index_of(METRIC_COLUMN), Some(METRIC_IDX));
    }
}
