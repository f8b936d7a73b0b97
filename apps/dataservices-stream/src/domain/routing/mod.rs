//! Endpoint Routing
//!
//! Pure lookup from (exchange, data type, subtype, stream type) to a
//! streaming endpoint, plus the High Frequency News (HFN) routes keyed by
//! country.
//!
//! Every dimension is parsed on its own before the combined lookup, so an
//! error always names the offending field and the values it accepts.
//!
//! # Example
//!
//! ```rust
//! use dataservices_stream::domain::routing::EndpointResolver;
//!
//! let resolver = EndpointResolver::default();
//! let url = resolver.resolve("b3", "trades", Some("stocks"), "realtime").unwrap();
//! assert!(url.ends_with("v2/marketdata/trade/stocks"));
//! ```

use std::fmt;
use std::str::FromStr;

/// Default base URL for all streaming endpoints.
pub const DEFAULT_STREAM_BASE_URL: &str = "wss://dataservices.btgpactualsolutions.com/stream/";

// =============================================================================
// Error Type
// =============================================================================

/// Routing dimension named by a [`RoutingError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteField {
    /// Exchange (`b3`, `bmv`, `nasdaq`).
    Exchange,
    /// Market data type (`trades`, `books`, ...).
    DataType,
    /// Instrument class (`stocks`, `options`, ...).
    Subtype,
    /// Feed timing (`realtime`, `delayed`, `throttle`).
    StreamType,
    /// HFN country.
    Country,
}

impl RouteField {
    /// Field name as it appears in configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exchange => "exchange",
            Self::DataType => "data_type",
            Self::Subtype => "subtype",
            Self::StreamType => "stream_type",
            Self::Country => "country",
        }
    }
}

impl fmt::Display for RouteField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    /// A value is unknown, or the combination has no endpoint.
    #[error(
        "unsupported combination: {field} `{value}` is not one of [{}]",
        .accepted.join(", ")
    )]
    UnsupportedCombination {
        /// Offending dimension.
        field: RouteField,
        /// Rejected value.
        value: String,
        /// Values accepted at that point of the lookup.
        accepted: Vec<&'static str>,
    },
}

impl RoutingError {
    fn unsupported(field: RouteField, value: &str, accepted: Vec<&'static str>) -> Self {
        Self::UnsupportedCombination {
            field,
            value: value.to_string(),
            accepted,
        }
    }

    /// The dimension this error blames.
    #[must_use]
    pub const fn field(&self) -> RouteField {
        match self {
            Self::UnsupportedCombination { field, .. } => *field,
        }
    }
}

// =============================================================================
// Dimensions
// =============================================================================

/// Exchange serving the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Exchange {
    /// Brasil Bolsa Balcão.
    #[default]
    B3,
    /// Bolsa Mexicana de Valores.
    Bmv,
    /// Nasdaq.
    Nasdaq,
}

impl Exchange {
    /// Every supported exchange.
    pub const ALL: [Self; 3] = [Self::B3, Self::Bmv, Self::Nasdaq];

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::B3 => "b3",
            Self::Bmv => "bmv",
            Self::Nasdaq => "nasdaq",
        }
    }
}

/// Market data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    /// Trade prints.
    #[default]
    Trades,
    /// Trades after server-side processing.
    ProcessedTrades,
    /// Order book updates.
    Books,
    /// Security list.
    Securities,
    /// Index values.
    Indices,
    /// One-second candles.
    Candles1S,
    /// One-minute candles.
    Candles1M,
    /// Stop loss notifications.
    Stoploss,
    /// Trading status per instrument.
    InstrumentStatus,
}

impl DataType {
    /// Every supported data type.
    pub const ALL: [Self; 9] = [
        Self::Trades,
        Self::ProcessedTrades,
        Self::Books,
        Self::Securities,
        Self::Indices,
        Self::Candles1S,
        Self::Candles1M,
        Self::Stoploss,
        Self::InstrumentStatus,
    ];

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trades => "trades",
            Self::ProcessedTrades => "processed-trades",
            Self::Books => "books",
            Self::Securities => "securities",
            Self::Indices => "indices",
            Self::Candles1S => "candles-1S",
            Self::Candles1M => "candles-1M",
            Self::Stoploss => "stoploss",
            Self::InstrumentStatus => "instrument_status",
        }
    }
}

/// Instrument class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subtype {
    /// Every instrument class.
    All,
    /// Equities.
    Stocks,
    /// Listed options.
    Options,
    /// Futures and other derivatives.
    Derivatives,
}

impl Subtype {
    /// Every supported subtype.
    pub const ALL: [Self; 4] = [Self::All, Self::Stocks, Self::Options, Self::Derivatives];

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Stocks => "stocks",
            Self::Options => "options",
            Self::Derivatives => "derivatives",
        }
    }

    /// Subtype used when the caller does not pick one.
    ///
    /// B3 feeds default to `stocks`, except indices which only exist as `all`.
    #[must_use]
    pub const fn default_for(exchange: Exchange, data_type: DataType) -> Self {
        match (exchange, data_type) {
            (Exchange::B3, DataType::Indices) => Self::All,
            (Exchange::B3, _) => Self::Stocks,
            _ => Self::All,
        }
    }
}

/// Feed timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamType {
    /// Live feed.
    #[default]
    Realtime,
    /// Delayed feed.
    Delayed,
    /// Conflated feed.
    Throttle,
}

impl StreamType {
    /// Every supported stream type.
    pub const ALL: [Self; 3] = [Self::Realtime, Self::Delayed, Self::Throttle];

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::Delayed => "delayed",
            Self::Throttle => "throttle",
        }
    }
}

/// Country of a High Frequency News feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Country {
    /// Brazil.
    #[default]
    Brazil,
    /// Mexico.
    Mexico,
    /// Chile.
    Chile,
}

impl Country {
    /// Every supported country.
    pub const ALL: [Self; 3] = [Self::Brazil, Self::Mexico, Self::Chile];

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Brazil => "brazil",
            Self::Mexico => "mexico",
            Self::Chile => "chile",
        }
    }
}

fn parse_dimension<T: Copy>(
    field: RouteField,
    value: &str,
    all: &[T],
    name: fn(T) -> &'static str,
) -> Result<T, RoutingError> {
    all.iter()
        .copied()
        .find(|candidate| name(*candidate) == value)
        .ok_or_else(|| {
            RoutingError::unsupported(field, value, all.iter().map(|v| name(*v)).collect())
        })
}

impl FromStr for Exchange {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_dimension(RouteField::Exchange, s, &Self::ALL, Self::as_str)
    }
}

impl FromStr for DataType {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_dimension(RouteField::DataType, s, &Self::ALL, Self::as_str)
    }
}

impl FromStr for Subtype {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_dimension(RouteField::Subtype, s, &Self::ALL, Self::as_str)
    }
}

impl FromStr for StreamType {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_dimension(RouteField::StreamType, s, &Self::ALL, Self::as_str)
    }
}

impl FromStr for Country {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_dimension(RouteField::Country, s, &Self::ALL, Self::as_str)
    }
}

// =============================================================================
// Routing Table
// =============================================================================

struct Route {
    exchange: Exchange,
    data_type: DataType,
    stream_type: StreamType,
    subtype: Subtype,
    path: &'static str,
}

const fn route(
    exchange: Exchange,
    data_type: DataType,
    stream_type: StreamType,
    subtype: Subtype,
    path: &'static str,
) -> Route {
    Route {
        exchange,
        data_type,
        stream_type,
        subtype,
        path,
    }
}

use DataType::{
    Books, Candles1M, Candles1S, Indices, InstrumentStatus, ProcessedTrades, Securities, Stoploss,
    Trades,
};
use Exchange::{B3, Bmv};
use StreamType::{Delayed, Realtime, Throttle};
use Subtype::{All, Derivatives, Options, Stocks};

static MARKET_DATA_ROUTES: &[Route] = &[
    route(B3, Trades, Realtime, Stocks, "v2/marketdata/trade/stocks"),
    route(B3, Trades, Realtime, Options, "v2/marketdata/trade/options"),
    route(B3, Trades, Realtime, Derivatives, "v2/marketdata/trade/derivatives"),
    route(B3, Trades, Delayed, Stocks, "v2/marketdata/trade/stocks/delayed"),
    route(B3, Trades, Delayed, Options, "v2/marketdata/trade/options/delayed"),
    route(B3, Trades, Delayed, Derivatives, "v2/marketdata/trade/derivatives/delayed"),
    route(B3, Trades, Throttle, Stocks, "v2/marketdata/throttle/trade/stocks"),
    route(B3, Trades, Throttle, Options, "v2/marketdata/throttle/trade/options"),
    route(B3, Trades, Throttle, Derivatives, "v2/marketdata/throttle/trade/derivatives"),
    route(B3, ProcessedTrades, Realtime, Stocks, "v2/marketdata/processed/trade/stocks"),
    route(B3, ProcessedTrades, Realtime, Options, "v2/marketdata/processed/trade/options"),
    route(B3, ProcessedTrades, Realtime, Derivatives, "v2/marketdata/processed/trade/derivatives"),
    route(B3, Books, Realtime, Stocks, "v2/marketdata/book/stocks"),
    route(B3, Books, Realtime, Options, "v2/marketdata/book/options"),
    route(B3, Books, Realtime, Derivatives, "v2/marketdata/book/derivatives"),
    route(B3, Books, Throttle, Stocks, "v2/marketdata/throttle/book/stocks"),
    route(B3, Books, Throttle, Options, "v2/marketdata/throttle/book/options"),
    route(B3, Books, Throttle, Derivatives, "v2/marketdata/throttle/book/derivatives"),
    route(B3, Securities, Realtime, Stocks, "v1/marketdata/sec_list/stocks"),
    route(B3, Securities, Realtime, Options, "v1/marketdata/sec_list/options"),
    route(B3, Securities, Realtime, Derivatives, "v1/marketdata/sec_list/derivatives"),
    route(B3, Indices, Realtime, All, "v2/marketdata/indices"),
    route(B3, Indices, Delayed, All, "v2/marketdata/indices/delayed"),
    route(B3, Candles1S, Realtime, Stocks, "v1/marketdata/candles/1S/stocks"),
    route(B3, Candles1S, Realtime, Derivatives, "v1/marketdata/candles/1S/derivatives"),
    route(B3, Candles1M, Realtime, Stocks, "v1/marketdata/candles/1M/stocks"),
    route(B3, Candles1M, Realtime, Derivatives, "v1/marketdata/candles/1M/derivatives"),
    route(B3, Stoploss, Realtime, Stocks, "v1/marketdata/stoploss/stocks"),
    route(B3, Stoploss, Realtime, Derivatives, "v1/marketdata/stoploss/derivatives"),
    route(B3, InstrumentStatus, Realtime, Stocks, "v2/marketdata/instrument_status/stocks"),
    route(B3, InstrumentStatus, Realtime, Derivatives, "v2/marketdata/instrument_status/derivatives"),
    route(B3, InstrumentStatus, Realtime, Options, "v2/marketdata/instrument_status/options"),
    route(Bmv, Trades, Realtime, All, "v1/marketdata/bmv/trades"),
];

static HFN_ROUTES: &[(Country, StreamType, &str)] = &[
    (Country::Brazil, Realtime, "v2/hfn/brazil"),
    (Country::Chile, Realtime, "v2/hfn/chile"),
];

/// Keep the routes whose projected dimension equals `wanted`, or blame `field`.
fn narrow<'a, T: Copy + PartialEq>(
    routes: Vec<&'a Route>,
    field: RouteField,
    wanted: T,
    project: fn(&Route) -> T,
    name: fn(T) -> &'static str,
) -> Result<Vec<&'a Route>, RoutingError> {
    let mut accepted: Vec<&'static str> = Vec::new();
    for candidate in routes.iter().map(|r| name(project(r))) {
        if !accepted.contains(&candidate) {
            accepted.push(candidate);
        }
    }

    let narrowed: Vec<&Route> = routes.into_iter().filter(|r| project(r) == wanted).collect();
    if narrowed.is_empty() {
        return Err(RoutingError::unsupported(field, name(wanted), accepted));
    }
    Ok(narrowed)
}

// =============================================================================
// Route Keys
// =============================================================================

/// Fully typed market data route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MarketDataRoute {
    /// Exchange.
    pub exchange: Exchange,
    /// Data type.
    pub data_type: DataType,
    /// Subtype, or `None` for the exchange default.
    pub subtype: Option<Subtype>,
    /// Stream type.
    pub stream_type: StreamType,
}

impl MarketDataRoute {
    /// Parse every dimension independently.
    ///
    /// # Errors
    ///
    /// Returns the first dimension that is not a known value.
    pub fn parse(
        exchange: &str,
        data_type: &str,
        subtype: Option<&str>,
        stream_type: &str,
    ) -> Result<Self, RoutingError> {
        Ok(Self {
            exchange: exchange.parse()?,
            data_type: data_type.parse()?,
            subtype: subtype.map(str::parse).transpose()?,
            stream_type: stream_type.parse()?,
        })
    }

    /// The subtype the lookup will use.
    #[must_use]
    pub fn effective_subtype(&self) -> Subtype {
        self.subtype
            .unwrap_or_else(|| Subtype::default_for(self.exchange, self.data_type))
    }

    /// Endpoint path below the stream base URL.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first dimension with no matching route.
    pub fn path(&self) -> Result<&'static str, RoutingError> {
        let routes: Vec<&Route> = MARKET_DATA_ROUTES.iter().collect();
        let routes = narrow(
            routes,
            RouteField::Exchange,
            self.exchange,
            |r| r.exchange,
            Exchange::as_str,
        )?;
        let routes = narrow(
            routes,
            RouteField::DataType,
            self.data_type,
            |r| r.data_type,
            DataType::as_str,
        )?;
        let routes = narrow(
            routes,
            RouteField::StreamType,
            self.stream_type,
            |r| r.stream_type,
            StreamType::as_str,
        )?;
        let routes = narrow(
            routes,
            RouteField::Subtype,
            self.effective_subtype(),
            |r| r.subtype,
            Subtype::as_str,
        )?;

        routes.first().map(|r| r.path).ok_or_else(|| {
            RoutingError::unsupported(RouteField::Subtype, self.effective_subtype().as_str(), vec![])
        })
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Resolves routes against a base URL.
#[derive(Debug, Clone)]
pub struct EndpointResolver {
    base_url: String,
}

impl Default for EndpointResolver {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_BASE_URL)
    }
}

impl EndpointResolver {
    /// Create a resolver for a custom base URL.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    /// Base URL that route paths are appended to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve a market data endpoint from its wire names.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::UnsupportedCombination`] naming the offending field.
    pub fn resolve(
        &self,
        exchange: &str,
        data_type: &str,
        subtype: Option<&str>,
        stream_type: &str,
    ) -> Result<String, RoutingError> {
        let route = MarketDataRoute::parse(exchange, data_type, subtype, stream_type)?;
        self.resolve_route(&route)
    }

    /// Resolve a typed market data route.
    ///
    /// # Errors
    ///
    /// Returns an error when the combination has no endpoint.
    pub fn resolve_route(&self, route: &MarketDataRoute) -> Result<String, RoutingError> {
        Ok(self.join(route.path()?))
    }

    /// Resolve a High Frequency News endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error naming `country` or `stream_type`.
    pub fn resolve_hfn(&self, country: &str, stream_type: &str) -> Result<String, RoutingError> {
        let country: Country = country.parse()?;
        let stream_type: StreamType = stream_type.parse()?;

        let for_country: Vec<_> = HFN_ROUTES.iter().filter(|(c, _, _)| *c == country).collect();
        if for_country.is_empty() {
            return Err(RoutingError::unsupported(
                RouteField::Country,
                country.as_str(),
                HFN_ROUTES.iter().map(|(c, _, _)| c.as_str()).collect(),
            ));
        }

        for_country
            .iter()
            .find(|(_, s, _)| *s == stream_type)
            .map(|(_, _, path)| self.join(path))
            .ok_or_else(|| {
                RoutingError::unsupported(
                    RouteField::StreamType,
                    stream_type.as_str(),
                    for_country.iter().map(|(_, s, _)| s.as_str()).collect(),
                )
            })
    }

    fn join(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }
}

// =============================================================================
// Tests
// =============================================================================
