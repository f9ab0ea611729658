use crate::SharedIndex;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(SharedIndex);

pub fn register(reg: &mut Registry, index: SharedIndex) {
    reg.register_collector(Box::new(Instrumented(index)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.read();

        let version = ConstGauge::new(this.table().version() as i64);
        let version_encoder = encoder.encode_descriptor(
            "route_table_version",
            "The version of the currently published route table",
            None,
            MetricType::Gauge,
        )?;
        version.encode(version_encoder)?;

        let static_routes = ConstGauge::new(this.static_routes() as u32);
        let static_encoder = encoder.encode_descriptor(
            "static_route_index_size",
            "The number of statically configured routes",
            None,
            MetricType::Gauge,
        )?;
        static_routes.encode(static_encoder)?;

        let mut registered_encoder = encoder.encode_descriptor(
            "registered_route_index_size",
            "The number of registered routes in index",
            None,
            MetricType::Gauge,
        )?;
        for (ns, size) in this.namespace_sizes() {
            let labels = [("namespace", ns)];
            let routes = ConstGauge::new(size as u32);
            let routes_encoder = registered_encoder.encode_family(&labels)?;
            routes.encode(routes_encoder)?;
        }

        Ok(())
    }
}
