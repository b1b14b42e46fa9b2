#![allow(dead_code)]

use std::f64::consts::FRAC_PI_2;
use std::sync::RwLock;

use nalgebra::{Isometry3, Matrix4, Point3, SMatrix, UnitQuaternion, Vector3, Vector4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use trackalign::alignment_errors::FitError;
use trackalign::constants::{BoundMatrix, BoundVector, MM, UM};
use trackalign::fitter::TrackFitter;
use trackalign::geometry::{rotation_from_euler_zyx, DetectorElement, GeometryContext, SurfaceId};
use trackalign::trajectory::{BoundParameters, FittedTrajectory, Measurement, TrackState};

/// Position along the beam (global x) of the telescope planes.
pub const PLANE_POSITIONS: [f64; 6] = [-500.0, -300.0, -100.0, 100.0, 300.0, 500.0];
pub const SIGMA_LOC0: f64 = 30.0 * UM;
pub const SIGMA_LOC1: f64 = 50.0 * UM;

/// Planes face the beam: normal along global x, local u along global y, local v along
/// global z.
pub fn telescope_rotation() -> UnitQuaternion<f64> {
    rotation_from_euler_zyx(&Vector3::new(FRAC_PI_2, 0.0, FRAC_PI_2))
}

pub fn nominal_transform(x: f64) -> Isometry3<f64> {
    Isometry3::from_parts(Vector3::new(x, 0.0, 0.0).into(), telescope_rotation())
}

#[derive(Debug)]
pub struct TelescopePlane {
    id: SurfaceId,
    transform: RwLock<Isometry3<f64>>,
}

impl TelescopePlane {
    pub fn new(id: SurfaceId, transform: Isometry3<f64>) -> Self {
        TelescopePlane {
            id,
            transform: RwLock::new(transform),
        }
    }

    pub fn set_transform(&self, transform: &Isometry3<f64>) -> bool {
        match self.transform.write() {
            Ok(mut guard) => {
                *guard = *transform;
                true
            }
            Err(_) => false,
        }
    }
}

impl DetectorElement for TelescopePlane {
    fn surface_id(&self) -> SurfaceId {
        self.id
    }

    fn transform(&self, _gctx: &GeometryContext) -> Isometry3<f64> {
        *self.transform.read().unwrap()
    }
}

/// Updater writing straight into the plane.
pub fn update_plane(
    plane: &TelescopePlane,
    _gctx: &GeometryContext,
    transform: &Isometry3<f64>,
) -> bool {
    plane.set_transform(transform)
}

#[derive(Debug)]
pub struct Telescope {
    pub planes: Vec<TelescopePlane>,
}

impl Telescope {
    /// Six planes with ids 1..=6 at their nominal placement.
    pub fn nominal() -> Self {
        Telescope {
            planes: PLANE_POSITIONS
                .iter()
                .enumerate()
                .map(|(i, x)| TelescopePlane::new(SurfaceId(i as u64 + 1), nominal_transform(*x)))
                .collect(),
        }
    }

    pub fn plane(&self, id: SurfaceId) -> Option<&TelescopePlane> {
        self.planes.iter().find(|plane| plane.id == id)
    }

    pub fn transforms(&self, gctx: &GeometryContext) -> Vec<(SurfaceId, Isometry3<f64>)> {
        self.planes
            .iter()
            .map(|plane| (plane.id, plane.transform(gctx)))
            .collect()
    }
}

/// Straight line `y = y0 + ty·x`, `z = z0 + tz·x`, stored as `(y0, ty, z0, tz)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineParameters(pub Vector4<f64>);

pub type SourceLink = (SurfaceId, Measurement);

/// Local `(u, v)` of the intersection of a line with a plane.
pub fn intersect(transform: &Isometry3<f64>, line: &Vector4<f64>) -> Option<(f64, f64)> {
    let origin = Vector3::new(0.0, line[0], line[2]);
    let direction = Vector3::new(1.0, line[1], line[3]);
    let normal = transform.rotation * Vector3::z();
    let denominator = normal.dot(&direction);
    if denominator.abs() < 1e-12 {
        return None;
    }
    let s = normal.dot(&(transform.translation.vector - origin)) / denominator;
    let local = transform.inverse_transform_point(&Point3::from(origin + direction * s));
    Some((local.x, local.y))
}

/// Simulate straight tracks through `geometry` with Gaussian smeared 2-D hits.
///
/// Return
/// ----------
/// * The source links of every track and a starting estimate offset from the truth.
pub fn simulate_tracks(
    geometry: &[(SurfaceId, Isometry3<f64>)],
    n_tracks: usize,
    seed: u64,
) -> (Vec<Vec<SourceLink>>, Vec<LineParameters>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise0 = Normal::new(0.0, SIGMA_LOC0).unwrap();
    let noise1 = Normal::new(0.0, SIGMA_LOC1).unwrap();

    let mut tracks = Vec::with_capacity(n_tracks);
    let mut starts = Vec::with_capacity(n_tracks);
    for _ in 0..n_tracks {
        let truth = Vector4::new(
            rng.random_range(-5.0..5.0) * MM,
            rng.random_range(-0.005..0.005),
            rng.random_range(-5.0..5.0) * MM,
            rng.random_range(-0.005..0.005),
        );
        let links = geometry
            .iter()
            .map(|(id, transform)| {
                let (u, v) = intersect(transform, &truth).unwrap();
                let measurement = Measurement::local_2d(
                    u + noise0.sample(&mut rng),
                    v + noise1.sample(&mut rng),
                    SIGMA_LOC0,
                    SIGMA_LOC1,
                );
                (*id, measurement)
            })
            .collect();
        tracks.push(links);
        starts.push(LineParameters(truth + Vector4::new(0.5, 1e-3, -0.5, -1e-3)));
    }
    (tracks, starts)
}

/// Least-squares straight-line fit through the current telescope placement.
///
/// The smoothed covariance of state `k` is `L_k·C·L_kᵀ`, with `C` the covariance of the line
/// parameters and `L_k` the Jacobian of the bound parameters on plane `k`. The smoother gain
/// `A_k = L_k·(L_{k+1}ᵀ·L_{k+1})⁻¹·L_{k+1}ᵀ` reproduces `Cov(x_i, x_j) = L_i·C·L_jᵀ` along
/// the gain chain.
pub struct StraightLineFitter<'a> {
    pub telescope: &'a Telescope,
    pub iterations: usize,
}

impl<'a> StraightLineFitter<'a> {
    pub fn new(telescope: &'a Telescope) -> Self {
        StraightLineFitter {
            telescope,
            iterations: 3,
        }
    }
}

type BoundJacobian = SMatrix<f64, 6, 4>;

struct Hit<'s> {
    id: SurfaceId,
    transform: Isometry3<f64>,
    measurement: &'s Measurement,
}

fn predict(hit: &Hit<'_>, line: &Vector4<f64>) -> Result<(f64, f64), FitError> {
    intersect(&hit.transform, line).ok_or(FitError::PropagationFailed(hit.id))
}

fn bound_jacobian(hit: &Hit<'_>, line: &Vector4<f64>) -> Result<BoundJacobian, FitError> {
    let mut jacobian = BoundJacobian::zeros();
    let h = 1e-6;
    for p in 0..4 {
        let mut plus = *line;
        let mut minus = *line;
        plus[p] += h;
        minus[p] -= h;
        let (up, vp) = predict(hit, &plus)?;
        let (um, vm) = predict(hit, &minus)?;
        jacobian[(0, p)] = (up - um) / (2.0 * h);
        jacobian[(1, p)] = (vp - vm) / (2.0 * h);
    }

    let (ty, tz) = (line[1], line[3]);
    let transverse = (1.0 + ty * ty).sqrt();
    let norm2 = 1.0 + ty * ty + tz * tz;
    jacobian[(2, 1)] = 1.0 / (1.0 + ty * ty);
    jacobian[(3, 1)] = ty * tz / (transverse * norm2);
    jacobian[(3, 3)] = -transverse / norm2;
    Ok(jacobian)
}

fn bound_parameters(hit: &Hit<'_>, line: &Vector4<f64>) -> Result<BoundVector, FitError> {
    let (u, v) = predict(hit, line)?;
    let (ty, tz) = (line[1], line[3]);
    let phi = ty.atan2(1.0);
    let theta = (1.0 + ty * ty).sqrt().atan2(tz);
    Ok(BoundVector::new(u, v, phi, theta, 1.0, 0.0))
}

impl TrackFitter for StraightLineFitter<'_> {
    type SourceLink = SourceLink;
    type StartParameters = LineParameters;
    type Options = GeometryContext;

    fn fit(
        &self,
        source_links: &[SourceLink],
        start_parameters: &LineParameters,
        gctx: &GeometryContext,
    ) -> Result<FittedTrajectory, FitError> {
        if source_links.is_empty() {
            return Err(FitError::NoMeasurements);
        }
        let hits = source_links
            .iter()
            .map(|(id, measurement)| {
                let plane = self
                    .telescope
                    .plane(*id)
                    .ok_or(FitError::PropagationFailed(*id))?;
                Ok(Hit {
                    id: *id,
                    transform: plane.transform(gctx),
                    measurement,
                })
            })
            .collect::<Result<Vec<_>, FitError>>()?;

        let mut line = start_parameters.0;
        let mut information = Matrix4::zeros();
        for _ in 0..self.iterations {
            let mut gradient = Vector4::zeros();
            information = Matrix4::zeros();
            for hit in &hits {
                let jacobian = bound_jacobian(hit, &line)?;
                let (u, v) = predict(hit, &line)?;
                let values = hit.measurement.values();
                let covariance = hit.measurement.covariance();
                for (row, predicted) in [(0, u), (1, v)] {
                    let weight = 1.0 / covariance[(row, row)];
                    let derivative = jacobian.row(row).transpose();
                    information += derivative * derivative.transpose() * weight;
                    gradient += derivative * (values[row] - predicted) * weight;
                }
            }
            let step = information
                .cholesky()
                .ok_or_else(|| FitError::Other("singular line fit".into()))?
                .solve(&gradient);
            line += step;
        }
        let covariance = information
            .try_inverse()
            .ok_or_else(|| FitError::Other("singular line fit".into()))?;

        let jacobians = hits
            .iter()
            .map(|hit| bound_jacobian(hit, &line))
            .collect::<Result<Vec<_>, FitError>>()?;

        let mut states = Vec::with_capacity(hits.len());
        for (k, hit) in hits.iter().enumerate() {
            let jacobian = &jacobians[k];
            let smoothed: BoundMatrix = jacobian * covariance * jacobian.transpose();
            let mut state = TrackState::new(hit.id)
                .with_measurement(hit.measurement.clone())
                .with_smoothed(BoundParameters::new(bound_parameters(hit, &line)?, smoothed));

            if let Some(next) = jacobians.get(k + 1) {
                let normal = (next.transpose() * next)
                    .try_inverse()
                    .ok_or_else(|| FitError::Other("singular smoother gain".into()))?;
                state = state.with_smoother_gain(jacobian * normal * next.transpose());
            }
            states.push(state);
        }

        Ok(FittedTrajectory::new(states))
    }
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
