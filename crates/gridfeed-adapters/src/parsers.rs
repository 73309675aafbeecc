use gridfeed_core::{DimensionKind, Measurement, ParserKind};

use crate::table::{Header, Row};
use crate::{parse_with, Layout, ParseError, ParseOutcome, ReportParser, RowError};

const TIME_STAMP: &[&str] = &["Time Stamp", "Timestamp"];
const TIME_ZONE: &[&str] = &["Time Zone"];
const ZONE_NAME: &[&str] = &["Name", "Zone Name", "Zone"];
const PTID: &[&str] = &["PTID"];

macro_rules! report_parser {
    ($parser:ident, $kind:expr, $layout:ty) => {
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $parser;

        impl ReportParser for $parser {
            fn kind(&self) -> ParserKind {
                $kind
            }

            fn parse(&self, source_id: &str, content: &str) -> Result<ParseOutcome, ParseError> {
                parse_with::<$layout>(source_id, content)
            }
        }
    };
}

report_parser!(ZonalPriceParser, ParserKind::ZonalPrice, ZonalPriceLayout);
report_parser!(ZonalLoadParser, ParserKind::ZonalLoad, ZonalLoadLayout);
report_parser!(LoadForecastParser, ParserKind::LoadForecast, LoadForecastLayout);
report_parser!(InterfaceFlowParser, ParserKind::InterfaceFlow, InterfaceFlowLayout);
report_parser!(AncillaryPriceParser, ParserKind::AncillaryPrice, AncillaryPriceLayout);
report_parser!(FuelMixParser, ParserKind::FuelMix, FuelMixLayout);
report_parser!(ConstraintParser, ParserKind::Constraint, ConstraintLayout);

fn zone_key(raw: &str) -> String {
    raw.trim().to_uppercase()
}

fn insert_value(record: &mut Measurement, field: &str, value: Option<f64>) {
    if let Some(value) = value {
        record.values.insert(field.to_string(), value);
    }
}

fn insert_label(record: &mut Measurement, field: &str, value: Option<&str>) {
    if let Some(value) = value {
        record.labels.insert(field.to_string(), value.to_string());
    }
}

/// Zonal LBMP reports (real-time, day-ahead and time-weighted).
pub(crate) struct ZonalPriceLayout {
    timestamp: usize,
    zone: usize,
    ptid: Option<usize>,
    lbmp: usize,
    losses: Option<usize>,
    congestion: Option<usize>,
}

impl Layout for ZonalPriceLayout {
    fn bind(header: &Header) -> Result<Self, ParseError> {
        Ok(Self {
            timestamp: header.require(TIME_STAMP)?,
            zone: header.require(ZONE_NAME)?,
            ptid: header.find(PTID),
            lbmp: header.require(&["LBMP ($/MWHr)", "LBMP"])?,
            losses: header.find(&["Marginal Cost Losses ($/MWHr)", "Marginal Cost Losses"]),
            congestion: header.find(&[
                "Marginal Cost Congestion ($/MWHr)",
                "Marginal Cost Congestion",
            ]),
        })
    }

    fn records(&self, source_id: &str, row: &Row<'_>) -> Result<Vec<Measurement>, RowError> {
        let timestamp = row.timestamp(self.timestamp)?;
        let zone = zone_key(row.required_text(self.zone, "zone name")?);
        let lbmp = row.required_number(self.lbmp, "LBMP")?;
        let losses = row.number(self.losses, "marginal cost losses")?;
        let congestion = row.number(self.congestion, "marginal cost congestion")?;

        let mut record = Measurement::new(source_id, DimensionKind::Zone, zone, timestamp);
        insert_value(&mut record, "lbmp", Some(lbmp));
        insert_value(&mut record, "marginal_cost_losses", losses);
        insert_value(&mut record, "marginal_cost_congestion", congestion);
        insert_label(&mut record, "ptid", self.ptid.and_then(|i| row.text(i)));
        Ok(vec![record])
    }
}

/// Real-time actual load per zone.
pub(crate) struct ZonalLoadLayout {
    timestamp: usize,
    time_zone: Option<usize>,
    zone: usize,
    ptid: Option<usize>,
    load: usize,
}

impl Layout for ZonalLoadLayout {
    fn bind(header: &Header) -> Result<Self, ParseError> {
        Ok(Self {
            timestamp: header.require(TIME_STAMP)?,
            time_zone: header.find(TIME_ZONE),
            zone: header.require(ZONE_NAME)?,
            ptid: header.find(PTID),
            load: header.require(&["Load", "Load (MW)"])?,
        })
    }

    fn records(&self, source_id: &str, row: &Row<'_>) -> Result<Vec<Measurement>, RowError> {
        let timestamp = row.timestamp(self.timestamp)?;
        let zone = zone_key(row.required_text(self.zone, "zone name")?);
        let load = row.required_number(self.load, "load")?;

        let mut record = Measurement::new(source_id, DimensionKind::Zone, zone, timestamp);
        insert_value(&mut record, "load_mw", Some(load));
        insert_label(&mut record, "ptid", self.ptid.and_then(|i| row.text(i)));
        insert_label(&mut record, "time_zone", self.time_zone.and_then(|i| row.text(i)));
        Ok(vec![record])
    }
}

/// Wide load forecast: one column per zone plus a system total that is not
/// a zone.
pub(crate) struct LoadForecastLayout {
    timestamp: usize,
    zones: Vec<(usize, String)>,
}

impl Layout for LoadForecastLayout {
    fn bind(header: &Header) -> Result<Self, ParseError> {
        let timestamp = header.require(TIME_STAMP)?;
        let time_zone = header.find(TIME_ZONE);
        let zones: Vec<(usize, String)> = header
            .columns()
            .filter(|(i, name)| {
                *i != timestamp && Some(*i) != time_zone && !name.is_empty() && *name != "nyiso"
            })
            .map(|(i, name)| (i, zone_key(name)))
            .collect();
        if zones.is_empty() {
            return Err(ParseError::MissingColumn {
                column: "zone forecast columns".to_string(),
            });
        }
        Ok(Self { timestamp, zones })
    }

    fn records(&self, source_id: &str, row: &Row<'_>) -> Result<Vec<Measurement>, RowError> {
        let timestamp = row.timestamp(self.timestamp)?;
        let mut records = Vec::with_capacity(self.zones.len());
        for (index, zone) in &self.zones {
            let Some(forecast) = row.number(Some(*index), "forecast load")? else {
                continue;
            };
            let mut record =
                Measurement::new(source_id, DimensionKind::Zone, zone.clone(), timestamp);
            insert_value(&mut record, "forecast_load_mw", Some(forecast));
            records.push(record);
        }
        Ok(records)
    }
}

/// External interface limits and flows.
pub(crate) struct InterfaceFlowLayout {
    timestamp: usize,
    interface: usize,
    point_id: Option<usize>,
    flow: usize,
    positive_limit: Option<usize>,
    negative_limit: Option<usize>,
}

impl Layout for InterfaceFlowLayout {
    fn bind(header: &Header) -> Result<Self, ParseError> {
        Ok(Self {
            timestamp: header.require(TIME_STAMP)?,
            interface: header.require(&["Interface Name", "Interface"])?,
            point_id: header.find(&["Point ID", "PTID"]),
            flow: header.require(&["Flow (MWH)", "Flow (MW)", "Flow"])?,
            positive_limit: header.find(&["Positive Limit (MWH)", "Positive Limit (MW)"]),
            negative_limit: header.find(&["Negative Limit (MWH)", "Negative Limit (MW)"]),
        })
    }

    fn records(&self, source_id: &str, row: &Row<'_>) -> Result<Vec<Measurement>, RowError> {
        let timestamp = row.timestamp(self.timestamp)?;
        let interface = row.required_text(self.interface, "interface name")?.to_string();
        let flow = row.required_number(self.flow, "flow")?;
        let positive = row.number(self.positive_limit, "positive limit")?;
        let negative = row.number(self.negative_limit, "negative limit")?;

        let mut record = Measurement::new(source_id, DimensionKind::Interface, interface, timestamp);
        insert_value(&mut record, "flow_mwh", Some(flow));
        insert_value(&mut record, "positive_limit_mwh", positive);
        insert_value(&mut record, "negative_limit_mwh", negative);
        insert_label(&mut record, "point_id", self.point_id.and_then(|i| row.text(i)));
        Ok(vec![record])
    }
}

const RESERVE_PRODUCTS: &[(&str, &str)] = &[
    ("10 Min Spinning Reserve ($/MWHr)", "spinning_reserve"),
    ("10 Min Non-Synchronous Reserve ($/MWHr)", "non_sync_reserve"),
    ("30 Min Operating Reserve ($/MWHr)", "operating_reserve"),
    ("NYCA Regulation Capacity ($/MWHr)", "regulation_capacity"),
    ("NYCA Regulation Movement ($/MW)", "regulation_movement"),
];

/// Ancillary service prices: one record per zone and reserve product.
pub(crate) struct AncillaryPriceLayout {
    timestamp: usize,
    zone: usize,
    ptid: Option<usize>,
    products: Vec<(usize, &'static str)>,
}

impl Layout for AncillaryPriceLayout {
    fn bind(header: &Header) -> Result<Self, ParseError> {
        let products: Vec<(usize, &'static str)> = RESERVE_PRODUCTS
            .iter()
            .filter_map(|(column, product)| header.find(&[*column]).map(|i| (i, *product)))
            .collect();
        if products.is_empty() {
            return Err(ParseError::MissingColumn {
                column: RESERVE_PRODUCTS[0].0.to_string(),
            });
        }
        Ok(Self {
            timestamp: header.require(TIME_STAMP)?,
            zone: header.require(ZONE_NAME)?,
            ptid: header.find(PTID),
            products,
        })
    }

    fn records(&self, source_id: &str, row: &Row<'_>) -> Result<Vec<Measurement>, RowError> {
        let timestamp = row.timestamp(self.timestamp)?;
        let zone = zone_key(row.required_text(self.zone, "zone name")?);
        let ptid = self.ptid.and_then(|i| row.text(i));

        let mut records = Vec::with_capacity(self.products.len());
        for (index, product) in &self.products {
            let Some(price) = row.number(Some(*index), "reserve price")? else {
                continue;
            };
            let mut record = Measurement::new(source_id, DimensionKind::Zone, zone.clone(), timestamp);
            record.series = Some((*product).to_string());
            insert_value(&mut record, "price", Some(price));
            insert_label(&mut record, "ptid", ptid);
            records.push(record);
        }
        Ok(records)
    }
}

fn fuel_key(raw: &str) -> String {
    raw.trim().to_lowercase().replace([' ', '-'], "_")
}

/// Generation by fuel, published long (`Fuel Category`, `Gen MW`) or wide
/// (one column per fuel).
pub(crate) enum FuelMixLayout {
    Long {
        timestamp: usize,
        time_zone: Option<usize>,
        fuel: usize,
        generation: usize,
    },
    Wide {
        timestamp: usize,
        time_zone: Option<usize>,
        fuels: Vec<(usize, String)>,
    },
}

impl Layout for FuelMixLayout {
    fn bind(header: &Header) -> Result<Self, ParseError> {
        let timestamp = header.require(TIME_STAMP)?;
        let time_zone = header.find(TIME_ZONE);
        if let Some(fuel) = header.find(&["Fuel Category", "Fuel Type", "Fuel"]) {
            return Ok(Self::Long {
                timestamp,
                time_zone,
                fuel,
                generation: header.require(&["Gen MW", "Generation MW", "Generation (MW)"])?,
            });
        }

        let fuels: Vec<(usize, String)> = header
            .columns()
            .filter(|(i, name)| {
                *i != timestamp && Some(*i) != time_zone && !name.is_empty() && *name != "total"
            })
            .map(|(i, name)| (i, fuel_key(name)))
            .collect();
        if fuels.is_empty() {
            return Err(ParseError::MissingColumn {
                column: "Fuel Category".to_string(),
            });
        }
        Ok(Self::Wide {
            timestamp,
            time_zone,
            fuels,
        })
    }

    fn records(&self, source_id: &str, row: &Row<'_>) -> Result<Vec<Measurement>, RowError> {
        match self {
            Self::Long {
                timestamp,
                time_zone,
                fuel,
                generation,
            } => {
                let ts = row.timestamp(*timestamp)?;
                let fuel = fuel_key(row.required_text(*fuel, "fuel category")?);
                let generation = row.required_number(*generation, "generation")?;
                let mut record = Measurement::new(source_id, DimensionKind::Fuel, fuel, ts);
                insert_value(&mut record, "generation_mw", Some(generation));
                insert_label(&mut record, "time_zone", time_zone.and_then(|i| row.text(i)));
                Ok(vec![record])
            }
            Self::Wide {
                timestamp,
                time_zone,
                fuels,
            } => {
                let ts = row.timestamp(*timestamp)?;
                let zone_label = time_zone.and_then(|i| row.text(i));
                let mut records = Vec::with_capacity(fuels.len());
                for (index, fuel) in fuels {
                    let Some(generation) = row.number(Some(*index), "generation")? else {
                        continue;
                    };
                    let mut record = Measurement::new(source_id, DimensionKind::Fuel, fuel.clone(), ts);
                    insert_value(&mut record, "generation_mw", Some(generation));
                    insert_label(&mut record, "time_zone", zone_label);
                    records.push(record);
                }
                Ok(records)
            }
        }
    }
}

/// Binding transmission constraints. A facility binding under several
/// contingencies in one interval yields one record per contingency.
pub(crate) struct ConstraintLayout {
    timestamp: usize,
    name: usize,
    contingency: Option<usize>,
    shadow_price: usize,
    limit: Option<usize>,
    flow: Option<usize>,
    facility_ptid: Option<usize>,
}

impl Layout for ConstraintLayout {
    fn bind(header: &Header) -> Result<Self, ParseError> {
        Ok(Self {
            timestamp: header.require(TIME_STAMP)?,
            name: header.require(&["Constraint Name", "Limiting Facility", "Name"])?,
            contingency: header.find(&["Contingency"]),
            shadow_price: header.require(&["Shadow Price", "Constraint Cost($)", "Constraint Cost", "Price"])?,
            limit: header.find(&["Limit (MW)", "Limit"]),
            flow: header.find(&["Flow (MW)", "Flow"]),
            facility_ptid: header.find(&["Facility PTID"]),
        })
    }

    fn records(&self, source_id: &str, row: &Row<'_>) -> Result<Vec<Measurement>, RowError> {
        let timestamp = row.timestamp(self.timestamp)?;
        let name = row.required_text(self.name, "constraint name")?.to_string();
        let shadow_price = row.required_number(self.shadow_price, "shadow price")?;
        let limit = row.number(self.limit, "limit")?;
        let flow = row.number(self.flow, "flow")?;

        let mut record = Measurement::new(source_id, DimensionKind::Constraint, name, timestamp);
        record.series = self
            .contingency
            .and_then(|i| row.text(i))
            .map(str::to_string);
        insert_value(&mut record, "shadow_price", Some(shadow_price));
        insert_value(&mut record, "limit_mw", limit);
        insert_value(&mut record, "flow_mw", flow);
        insert_label(&mut record, "facility_ptid", self.facility_ptid.and_then(|i| row.text(i)));
        Ok(vec![record])
    }
}
