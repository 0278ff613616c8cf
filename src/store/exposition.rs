use super::*;

use prometheus::proto::{self, MetricType};
use prometheus::{Encoder, TextEncoder};

impl Snapshot {
    /// Converts the snapshot into Prometheus metric families.
    pub fn to_families(&self) -> Vec<proto::MetricFamily> {
        self.families.iter().map(FamilySnapshot::to_family).collect()
    }

    /// Renders the snapshot in the Prometheus text exposition format.
    pub fn to_prometheus(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();

        let mut buffer = Vec::new();
        encoder.encode(&self.to_families(), &mut buffer)?;

        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl FamilySnapshot {
    fn to_family(&self) -> proto::MetricFamily {
        let mut family = proto::MetricFamily::default();
        family.set_name(self.name.to_string());
        family.set_help(self.description.to_string());
        family.set_field_type(match self.kind {
            MetricKind::Gauge => MetricType::GAUGE,
            MetricKind::Counter => MetricType::COUNTER,
        });

        for sample in &self.samples {
            let mut metric = proto::Metric::default();

            for (name, value) in self.labels.iter().zip(&sample.labels) {
                let mut pair = proto::LabelPair::default();
                pair.set_name(name.to_string());
                pair.set_value(value.clone());
                metric.mut_label().push(pair);
            }

            match self.kind {
                MetricKind::Gauge => metric.mut_gauge().set_value(sample.value),
                MetricKind::Counter => metric.mut_counter().set_value(sample.value),
            }

            family.mut_metric().push(metric);
        }

        family
    }
}
