//! Geometry model and the WKB -> PostGIS EWKB translator.
//!
//! The byte formats are handled by `geozero`. Source WKB (ISO type codes, as
//! produced by DuckDB's `ST_AsWKB`) is replayed into a [`Geometry`] through a
//! [`GeomProcessor`], and [`translate`] writes PostGIS EWKB stamped with the
//! layer SRID. [`decode_ewkb`] is its inverse.

use std::io::{self, Cursor};

use geozero::error::{GeozeroError, Result as GeozeroResult};
use geozero::wkb::{process_ewkb_geom, process_wkb_geom};
use geozero::{CoordDimensions, GeomProcessor, GeozeroGeometry, ToWkb};
use thiserror::Error;

use crate::error::LoadError;

/// Deepest collection nesting accepted from a source file.
pub const MAX_NESTING: usize = 64;

// Spatial reference identifier carried by every geometry of a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Srid {
    Known(i32),
    #[default]
    Unknown,
}

impl Srid {
    pub fn code(self) -> Option<i32> {
        match self {
            Srid::Known(code) => Some(code),
            Srid::Unknown => None,
        }
    }

    // PostGIS stores "unknown" as 0
    pub fn from_postgis(code: i32) -> Self {
        if code > 0 {
            Srid::Known(code)
        } else {
            Srid::Unknown
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Dimension {
    #[default]
    Xy,
    Xyz,
    Xym,
    Xyzm,
}

impl Dimension {
    pub fn from_flags(has_z: bool, has_m: bool) -> Self {
        match (has_z, has_m) {
            (false, false) => Dimension::Xy,
            (true, false) => Dimension::Xyz,
            (false, true) => Dimension::Xym,
            (true, true) => Dimension::Xyzm,
        }
    }

    pub fn has_z(self) -> bool {
        matches!(self, Dimension::Xyz | Dimension::Xyzm)
    }

    pub fn has_m(self) -> bool {
        matches!(self, Dimension::Xym | Dimension::Xyzm)
    }

    pub fn ordinates(self) -> usize {
        2 + usize::from(self.has_z()) + usize::from(self.has_m())
    }

    fn coord_dimensions(self) -> CoordDimensions {
        CoordDimensions {
            z: self.has_z(),
            m: self.has_m(),
            t: false,
            tm: false,
        }
    }

    // Suffix used in PostGIS type modifiers: geometry(PointZM, 4326)
    pub fn postgis_suffix(self) -> &'static str {
        match self {
            Dimension::Xy => "",
            Dimension::Xyz => "Z",
            Dimension::Xym => "M",
            Dimension::Xyzm => "ZM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryKind {
    Point,
    LineString,
    Polygon,
    MultiPoint,
    MultiLineString,
    MultiPolygon,
    GeometryCollection,
}

impl GeometryKind {
    pub fn postgis_name(self) -> &'static str {
        match self {
            GeometryKind::Point => "Point",
            GeometryKind::LineString => "LineString",
            GeometryKind::Polygon => "Polygon",
            GeometryKind::MultiPoint => "MultiPoint",
            GeometryKind::MultiLineString => "MultiLineString",
            GeometryKind::MultiPolygon => "MultiPolygon",
            GeometryKind::GeometryCollection => "GeometryCollection",
        }
    }

    // Accepts both PostGIS spellings (MULTIPOLYGON) and GDAL's (Multi Polygon)
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_')
            .collect::<String>()
            .to_ascii_uppercase();
        match normalized.as_str() {
            "POINT" => Some(GeometryKind::Point),
            "LINESTRING" => Some(GeometryKind::LineString),
            "POLYGON" => Some(GeometryKind::Polygon),
            "MULTIPOINT" => Some(GeometryKind::MultiPoint),
            "MULTILINESTRING" => Some(GeometryKind::MultiLineString),
            "MULTIPOLYGON" => Some(GeometryKind::MultiPolygon),
            "GEOMETRYCOLLECTION" => Some(GeometryKind::GeometryCollection),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
    pub m: Option<f64>,
}

impl Coord {
    pub fn xy(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            z: None,
            m: None,
        }
    }

    pub fn xyz(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z: Some(z),
            m: None,
        }
    }
}

pub type Ring = Vec<Coord>;

#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    /// `None` is the empty point.
    Point(Option<Coord>),
    LineString(Vec<Coord>),
    Polygon(Vec<Ring>),
    MultiPoint(Vec<Coord>),
    MultiLineString(Vec<Vec<Coord>>),
    MultiPolygon(Vec<Vec<Ring>>),
    GeometryCollection(Vec<Shape>),
}

impl Shape {
    pub fn kind(&self) -> GeometryKind {
        match self {
            Shape::Point(_) => GeometryKind::Point,
            Shape::LineString(_) => GeometryKind::LineString,
            Shape::Polygon(_) => GeometryKind::Polygon,
            Shape::MultiPoint(_) => GeometryKind::MultiPoint,
            Shape::MultiLineString(_) => GeometryKind::MultiLineString,
            Shape::MultiPolygon(_) => GeometryKind::MultiPolygon,
            Shape::GeometryCollection(_) => GeometryKind::GeometryCollection,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    pub srid: Srid,
    pub dimension: Dimension,
    pub shape: Shape,
}

impl Geometry {
    pub fn new(srid: Srid, dimension: Dimension, shape: Shape) -> Self {
        Self {
            srid,
            dimension,
            shape,
        }
    }

    pub fn kind(&self) -> GeometryKind {
        self.shape.kind()
    }

    pub fn with_srid(mut self, srid: Srid) -> Self {
        self.srid = srid;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeometryError {
    #[error("{0} is outside the OGC simple-feature set")]
    UnsupportedType(&'static str),
    #[error("geometry blob truncated at byte {offset}")]
    Truncated { offset: u64 },
    #[error("{0} trailing bytes after geometry")]
    TrailingBytes(u64),
    #[error("member dimension {found:?} differs from {expected:?}")]
    MixedDimension { expected: Dimension, found: Dimension },
    #[error("{0} outside a matching geometry part")]
    Misplaced(&'static str),
    #[error("collections nested deeper than {0} levels")]
    TooDeep(usize),
    #[error("{0}")]
    Malformed(String),
}

impl GeometryError {
    pub fn into_load_error(self, location: impl Into<String>) -> LoadError {
        let location = location.into();
        match self {
            GeometryError::UnsupportedType(name) => LoadError::UnsupportedGeometryType {
                detail: format!("{name} at {location}"),
            },
            other => LoadError::CorruptFile {
                location,
                reason: format!("malformed geometry: {other}"),
            },
        }
    }
}

/// Decode ISO WKB as written by `ST_AsWKB`. The SRID is `Srid::Unknown`; the
/// caller stamps the layer's.
pub fn decode_wkb(bytes: &[u8]) -> Result<Geometry, GeometryError> {
    decode_with(bytes, |cursor, builder| process_wkb_geom(cursor, builder))
}

/// Decode PostGIS EWKB, taking the SRID from the blob. Inverse of [`translate`].
pub fn decode_ewkb(bytes: &[u8]) -> Result<Geometry, GeometryError> {
    decode_with(bytes, |cursor, builder| process_ewkb_geom(cursor, builder))
}

/// Encode one geometry as little-endian PostGIS EWKB, with the SRID flag when
/// the SRID is known. Same geometry in, same bytes out.
pub fn translate(geometry: &Geometry) -> Result<Vec<u8>, GeometryError> {
    geometry
        .to_ewkb(geometry.dimension.coord_dimensions(), geometry.srid.code())
        .map_err(|e| GeometryError::Malformed(e.to_string()))
}

fn decode_with<F>(bytes: &[u8], process: F) -> Result<Geometry, GeometryError>
where
    F: FnOnce(&mut Cursor<&[u8]>, &mut ShapeBuilder) -> GeozeroResult<()>,
{
    let mut cursor = Cursor::new(bytes);
    let mut builder = ShapeBuilder::default();
    if let Err(e) = process(&mut cursor, &mut builder) {
        return Err(match builder.failure.take() {
            Some(failure) => failure,
            None => match e {
                GeozeroError::IoError(source) if source.kind() == io::ErrorKind::UnexpectedEof => {
                    GeometryError::Truncated {
                        offset: cursor.position(),
                    }
                }
                other => GeometryError::Malformed(other.to_string()),
            },
        });
    }
    let remaining = (bytes.len() as u64).saturating_sub(cursor.position());
    if remaining != 0 {
        return Err(GeometryError::TrailingBytes(remaining));
    }
    builder.finish()
}

// Parts still waiting for their end callback
enum Part {
    Point(Vec<Coord>),
    MultiPoint(Vec<Coord>),
    LineString(Vec<Coord>),
    Polygon(Vec<Ring>),
    MultiLineString(Vec<Vec<Coord>>),
    MultiPolygon(Vec<Vec<Ring>>),
    Collection(Vec<Shape>),
}

// Rebuilds a Shape from geozero's callbacks
#[derive(Default)]
struct ShapeBuilder {
    srid: Option<i32>,
    dimension: Option<Dimension>,
    open: Vec<Part>,
    finished: Option<Shape>,
    failure: Option<GeometryError>,
}

impl ShapeBuilder {
    fn fail(&mut self, error: GeometryError) -> GeozeroError {
        let message = error.to_string();
        self.failure = Some(error);
        GeozeroError::Geometry(message)
    }

    fn begin(&mut self, part: Part) -> GeozeroResult<()> {
        if self.open.len() >= MAX_NESTING {
            return Err(self.fail(GeometryError::TooDeep(MAX_NESTING)));
        }
        self.open.push(part);
        Ok(())
    }

    fn end(&mut self) -> GeozeroResult<Part> {
        match self.open.pop() {
            Some(part) => Ok(part),
            None => Err(self.fail(GeometryError::Misplaced("end of part"))),
        }
    }

    fn unsupported(&mut self, name: &'static str) -> GeozeroResult<()> {
        Err(self.fail(GeometryError::UnsupportedType(name)))
    }

    fn push_coord(&mut self, coord: Coord) -> GeozeroResult<()> {
        let found = Dimension::from_flags(coord.z.is_some(), coord.m.is_some());
        match self.dimension {
            None => self.dimension = Some(found),
            Some(expected) if expected != found => {
                return Err(self.fail(GeometryError::MixedDimension { expected, found }));
            }
            Some(_) => {}
        }
        if let Some(Part::Point(coords) | Part::MultiPoint(coords) | Part::LineString(coords)) =
            self.open.last_mut()
        {
            coords.push(coord);
            return Ok(());
        }
        Err(self.fail(GeometryError::Misplaced("coordinate")))
    }

    // A completed shape goes into the enclosing collection, or is the result
    fn emit(&mut self, shape: Shape) -> GeozeroResult<()> {
        if let Some(Part::Collection(members)) = self.open.last_mut() {
            members.push(shape);
            return Ok(());
        }
        if self.open.is_empty() && self.finished.is_none() {
            self.finished = Some(shape);
            return Ok(());
        }
        Err(self.fail(GeometryError::Misplaced("geometry")))
    }

    fn finish(self) -> Result<Geometry, GeometryError> {
        let shape = self
            .finished
            .ok_or_else(|| GeometryError::Malformed("no geometry in blob".into()))?;
        Ok(Geometry::new(
            self.srid.map(Srid::from_postgis).unwrap_or_default(),
            self.dimension.unwrap_or_default(),
            shape,
        ))
    }
}

impl GeomProcessor for ShapeBuilder {
    // Ask for z and m so they arrive through `coordinate` when present
    fn dimensions(&self) -> CoordDimensions {
        CoordDimensions::xyzm()
    }

    fn srid(&mut self, srid: Option<i32>) -> GeozeroResult<()> {
        self.srid = srid;
        Ok(())
    }

    fn xy(&mut self, x: f64, y: f64, _idx: usize) -> GeozeroResult<()> {
        self.push_coord(Coord::xy(x, y))
    }

    fn coordinate(
        &mut self,
        x: f64,
        y: f64,
        z: Option<f64>,
        m: Option<f64>,
        _t: Option<f64>,
        _tm: Option<u64>,
        _idx: usize,
    ) -> GeozeroResult<()> {
        self.push_coord(Coord { x, y, z, m })
    }

    fn empty_point(&mut self, _idx: usize) -> GeozeroResult<()> {
        match self.open.last() {
            Some(Part::Point(_)) | Some(Part::MultiPoint(_)) => Ok(()),
            _ => self.emit(Shape::Point(None)),
        }
    }

    fn point_begin(&mut self, _idx: usize) -> GeozeroResult<()> {
        self.begin(Part::Point(Vec::with_capacity(1)))
    }

    fn point_end(&mut self, _idx: usize) -> GeozeroResult<()> {
        let Part::Point(coords) = self.end()? else {
            return Err(self.fail(GeometryError::Misplaced("point")));
        };
        // Empty points travel as NaN ordinates
        let coord = coords
            .into_iter()
            .next()
            .filter(|c| !(c.x.is_nan() && c.y.is_nan()));
        if let Some(Part::MultiPoint(points)) = self.open.last_mut() {
            points.extend(coord);
            return Ok(());
        }
        self.emit(Shape::Point(coord))
    }

    fn multipoint_begin(&mut self, size: usize, _idx: usize) -> GeozeroResult<()> {
        self.begin(Part::MultiPoint(Vec::with_capacity(size.min(1024))))
    }

    fn multipoint_end(&mut self, _idx: usize) -> GeozeroResult<()> {
        let Part::MultiPoint(points) = self.end()? else {
            return Err(self.fail(GeometryError::Misplaced("multipoint")));
        };
        self.emit(Shape::MultiPoint(points))
    }

    fn linestring_begin(&mut self, _tagged: bool, size: usize, _idx: usize) -> GeozeroResult<()> {
        self.begin(Part::LineString(Vec::with_capacity(size.min(1024))))
    }

    fn linestring_end(&mut self, _tagged: bool, _idx: usize) -> GeozeroResult<()> {
        let Part::LineString(coords) = self.end()? else {
            return Err(self.fail(GeometryError::Misplaced("linestring")));
        };
        match self.open.last_mut() {
            Some(Part::Polygon(rings)) => {
                rings.push(coords);
                return Ok(());
            }
            Some(Part::MultiLineString(lines)) => {
                lines.push(coords);
                return Ok(());
            }
            _ => {}
        }
        self.emit(Shape::LineString(coords))
    }

    fn multilinestring_begin(&mut self, size: usize, _idx: usize) -> GeozeroResult<()> {
        self.begin(Part::MultiLineString(Vec::with_capacity(size.min(1024))))
    }

    fn multilinestring_end(&mut self, _idx: usize) -> GeozeroResult<()> {
        let Part::MultiLineString(lines) = self.end()? else {
            return Err(self.fail(GeometryError::Misplaced("multilinestring")));
        };
        self.emit(Shape::MultiLineString(lines))
    }

    fn polygon_begin(&mut self, _tagged: bool, size: usize, _idx: usize) -> GeozeroResult<()> {
        self.begin(Part::Polygon(Vec::with_capacity(size.min(1024))))
    }

    fn polygon_end(&mut self, _tagged: bool, _idx: usize) -> GeozeroResult<()> {
        let Part::Polygon(rings) = self.end()? else {
            return Err(self.fail(GeometryError::Misplaced("polygon")));
        };
        if let Some(Part::MultiPolygon(polygons)) = self.open.last_mut() {
            polygons.push(rings);
            return Ok(());
        }
        self.emit(Shape::Polygon(rings))
    }

    fn multipolygon_begin(&mut self, size: usize, _idx: usize) -> GeozeroResult<()> {
        self.begin(Part::MultiPolygon(Vec::with_capacity(size.min(1024))))
    }

    fn multipolygon_end(&mut self, _idx: usize) -> GeozeroResult<()> {
        let Part::MultiPolygon(polygons) = self.end()? else {
            return Err(self.fail(GeometryError::Misplaced("multipolygon")));
        };
        self.emit(Shape::MultiPolygon(polygons))
    }

    fn geometrycollection_begin(&mut self, size: usize, _idx: usize) -> GeozeroResult<()> {
        self.begin(Part::Collection(Vec::with_capacity(size.min(64))))
    }

    fn geometrycollection_end(&mut self, _idx: usize) -> GeozeroResult<()> {
        let Part::Collection(members) = self.end()? else {
            return Err(self.fail(GeometryError::Misplaced("geometrycollection")));
        };
        self.emit(Shape::GeometryCollection(members))
    }

    fn circularstring_begin(&mut self, _size: usize, _idx: usize) -> GeozeroResult<()> {
        self.unsupported("CircularString")
    }

    fn compoundcurve_begin(&mut self, _size: usize, _idx: usize) -> GeozeroResult<()> {
        self.unsupported("CompoundCurve")
    }

    fn curvepolygon_begin(&mut self, _size: usize, _idx: usize) -> GeozeroResult<()> {
        self.unsupported("CurvePolygon")
    }

    fn multicurve_begin(&mut self, _size: usize, _idx: usize) -> GeozeroResult<()> {
        self.unsupported("MultiCurve")
    }

    fn multisurface_begin(&mut self, _size: usize, _idx: usize) -> GeozeroResult<()> {
        self.unsupported("MultiSurface")
    }

    fn triangle_begin(&mut self, _tagged: bool, _size: usize, _idx: usize) -> GeozeroResult<()> {
        self.unsupported("Triangle")
    }

    fn polyhedralsurface_begin(&mut self, _size: usize, _idx: usize) -> GeozeroResult<()> {
        self.unsupported("PolyhedralSurface")
    }

    fn tin_begin(&mut self, _size: usize, _idx: usize) -> GeozeroResult<()> {
        self.unsupported("Tin")
    }
}

impl GeozeroGeometry for Geometry {
    fn process_geom<P: GeomProcessor>(&self, processor: &mut P) -> GeozeroResult<()> {
        process_shape(&self.shape, self.dimension, 0, processor)
    }
}

fn process_coord<P: GeomProcessor>(
    coord: &Coord,
    dimension: Dimension,
    idx: usize,
    processor: &mut P,
) -> GeozeroResult<()> {
    if processor.multi_dim() {
        processor.coordinate(
            coord.x,
            coord.y,
            dimension.has_z().then(|| coord.z.unwrap_or(f64::NAN)),
            dimension.has_m().then(|| coord.m.unwrap_or(f64::NAN)),
            None,
            None,
            idx,
        )
    } else {
        processor.xy(coord.x, coord.y, idx)
    }
}

fn process_line<P: GeomProcessor>(
    coords: &[Coord],
    tagged: bool,
    dimension: Dimension,
    idx: usize,
    processor: &mut P,
) -> GeozeroResult<()> {
    processor.linestring_begin(tagged, coords.len(), idx)?;
    for (i, coord) in coords.iter().enumerate() {
        process_coord(coord, dimension, i, processor)?;
    }
    processor.linestring_end(tagged, idx)
}

fn process_polygon<P: GeomProcessor>(
    rings: &[Ring],
    tagged: bool,
    dimension: Dimension,
    idx: usize,
    processor: &mut P,
) -> GeozeroResult<()> {
    processor.polygon_begin(tagged, rings.len(), idx)?;
    for (i, ring) in rings.iter().enumerate() {
        process_line(ring, false, dimension, i, processor)?;
    }
    processor.polygon_end(tagged, idx)
}

fn process_shape<P: GeomProcessor>(
    shape: &Shape,
    dimension: Dimension,
    idx: usize,
    processor: &mut P,
) -> GeozeroResult<()> {
    match shape {
        Shape::Point(coord) => {
            let empty = Coord {
                x: f64::NAN,
                y: f64::NAN,
                z: None,
                m: None,
            };
            processor.point_begin(idx)?;
            process_coord(coord.as_ref().unwrap_or(&empty), dimension, 0, processor)?;
            processor.point_end(idx)
        }
        Shape::LineString(coords) => process_line(coords, true, dimension, idx, processor),
        Shape::Polygon(rings) => process_polygon(rings, true, dimension, idx, processor),
        Shape::MultiPoint(points) => {
            processor.multipoint_begin(points.len(), idx)?;
            for (i, point) in points.iter().enumerate() {
                process_coord(point, dimension, i, processor)?;
            }
            processor.multipoint_end(idx)
        }
        Shape::MultiLineString(lines) => {
            processor.multilinestring_begin(lines.len(), idx)?;
            for (i, line) in lines.iter().enumerate() {
                process_line(line, false, dimension, i, processor)?;
            }
            processor.multilinestring_end(idx)
        }
        Shape::MultiPolygon(polygons) => {
            processor.multipolygon_begin(polygons.len(), idx)?;
            for (i, rings) in polygons.iter().enumerate() {
                process_polygon(rings, false, dimension, i, processor)?;
            }
            processor.multipolygon_end(idx)
        }
        Shape::GeometryCollection(members) => {
            processor.geometrycollection_begin(members.len(), idx)?;
            for (i, member) in members.iter().enumerate() {
                process_shape(member, dimension, i, processor)?;
            }
            processor.geometrycollection_end(idx)
        }
    }
}
