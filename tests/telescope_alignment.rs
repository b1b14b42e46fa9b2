use std::sync::Arc;

use approx::assert_abs_diff_eq;
use nalgebra::Vector3;

use trackalign::alignment::{
    Alignment, AlignmentConfig, AlignmentMask, AlignmentOptions, AlignmentResult, AlignmentStatus,
};
use trackalign::alignment_errors::AlignmentError;
use trackalign::alignment_state::AlignableSurfaces;
use trackalign::constants::{MM, UM};
use trackalign::convergence::ConvergenceCriterion;
use trackalign::geometry::{DetectorElement, GeometryContext, SurfaceId};
use trackalign::observer::AlignmentCounters;
use trackalign::trajectory::Measurement;

mod common;
use common::{
    init_logging, nominal_transform, simulate_tracks, telescope_rotation, update_plane,
    StraightLineFitter, Telescope, TelescopePlane, PLANE_POSITIONS, SIGMA_LOC0, SIGMA_LOC1,
};

/// Config freeing only the transverse shifts of the aligned planes.
fn transverse_shift_config(cutoff: f64, max_iterations: usize) -> AlignmentConfig {
    let masks = (0..max_iterations)
        .map(|i| format!(r#""{i}": "011000""#))
        .collect::<Vec<_>>()
        .join(", ");
    let json = format!(
        r#"{{
            "chi2_ondf_cutoff": {cutoff},
            "max_iterations": {max_iterations},
            "iteration_masks": {{ {masks} }}
        }}"#
    );
    AlignmentConfig::from_json_str(&json).unwrap()
}

#[test]
fn test_evaluate_telescope_tracks() {
    let gctx = GeometryContext::default();
    let telescope = Telescope::nominal();
    let (tracks, starts) = simulate_tracks(&telescope.transforms(&gctx), 100, 42);

    let alignment = Alignment::new(StraightLineFitter::new(&telescope));
    let aligned: Vec<&TelescopePlane> = telescope.planes[1..].iter().collect();
    let surfaces = AlignableSurfaces::new(&aligned).unwrap();

    let states = tracks
        .iter()
        .zip(&starts)
        .map(|(links, start)| {
            alignment.evaluate_track_alignment_state(
                &gctx,
                links,
                start,
                &gctx,
                &surfaces,
                &AlignmentMask::ALL,
            )
        })
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    for state in &states {
        assert_eq!(state.measurement_dim, 12);
        assert_eq!(state.track_parameters_dim, 36);
        assert_eq!(state.alignment_dof, 30);
        assert_eq!(state.aligned_surfaces.len(), 5);
        assert!(!state.aligned_surfaces.contains_key(&SurfaceId(1)));
        assert!(state.chi2 >= 0.0);
    }

    let state = &states[0];
    assert_eq!(state.aligned_surfaces[&SurfaceId(2)], (0, 0));
    assert_eq!(state.aligned_surfaces[&SurfaceId(6)], (4, 4));

    // Second plane, second measured state
    let block = state.measurement_covariance.view((2, 2), (2, 2));
    assert_abs_diff_eq!(block[(0, 0)], SIGMA_LOC0 * SIGMA_LOC0, epsilon = 1e-10);
    assert_abs_diff_eq!(block[(1, 1)], SIGMA_LOC1 * SIGMA_LOC1, epsilon = 1e-10);
    assert_abs_diff_eq!(block[(0, 1)], 0.0, epsilon = 1e-10);
    assert_eq!(state.projection_matrix[(2, 6)], 1.0);
    assert_eq!(state.projection_matrix[(3, 7)], 1.0);
    assert_eq!(state.projection_matrix[(2, 8)], 0.0);

    // Shifting a plane along global y moves the measured u of the track by the same amount
    assert_abs_diff_eq!(state.alignment_to_residual_derivative[(2, 1)], 1.0, epsilon = 1e-9);
    assert_abs_diff_eq!(state.alignment_to_residual_derivative[(3, 2)], 1.0, epsilon = 1e-9);
    assert_abs_diff_eq!(state.alignment_to_residual_derivative[(0, 1)], 0.0, epsilon = 1e-12);

    assert_abs_diff_eq!(
        state.residual_covariance,
        state.residual_covariance.transpose(),
        epsilon = 1e-12
    );
}

#[test]
fn test_recover_shifted_plane() {
    init_logging();
    let gctx = GeometryContext::default();

    let mut truth = Telescope::nominal().transforms(&gctx);
    truth[2].1.translation.vector += Vector3::new(0.0, 0.2 * MM, -0.1 * MM);
    let (tracks, starts) = simulate_tracks(&truth, 100, 42);

    let telescope = Telescope::nominal();
    let counters = Arc::new(AlignmentCounters::new());
    let alignment =
        Alignment::new(StraightLineFitter::new(&telescope)).with_observer(counters.clone());
    let options = AlignmentOptions::new(gctx, gctx, update_plane, vec![&telescope.planes[2]])
        .with_config(transverse_shift_config(1.0, 5));

    let result = alignment.align(&tracks, &starts, &options).unwrap();

    assert_eq!(
        result.status,
        AlignmentStatus::Converged {
            iteration: 1,
            criterion: ConvergenceCriterion::ChiSquareCutoff
        }
    );
    assert_eq!(result.iterations, 2);
    assert_eq!(result.num_tracks, 100);
    assert_eq!(result.alignment_dof, 6);
    assert_eq!(result.measurement_dim, 1200);
    assert!(result.average_chi2_ondf < 1.0);
    assert_eq!(counters.surface_updates(), 2);

    let aligned = result.aligned_parameters[&SurfaceId(3)];
    let shift = aligned.translation.vector - nominal_transform(PLANE_POSITIONS[2]).translation.vector;
    assert_abs_diff_eq!(shift.x, 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(shift.y, 0.2 * MM, epsilon = 20.0 * UM);
    assert_abs_diff_eq!(shift.z, -0.1 * MM, epsilon = 30.0 * UM);
    assert_abs_diff_eq!(aligned.rotation.angle_to(&telescope_rotation()), 0.0, epsilon = 1e-6);
    assert_eq!(telescope.planes[2].transform(&gctx), aligned);

    // Fixed parameters carry no uncertainty, free ones a few microns
    let covariance = &result.alignment_covariance;
    assert_eq!(covariance[(0, 0)], 0.0);
    assert_eq!(covariance[(5, 5)], 0.0);
    let sigma_y = covariance[(1, 1)].sqrt();
    assert!(sigma_y > 1.0 * UM && sigma_y < 10.0 * UM, "sigma_y = {sigma_y}");
}

#[test]
fn test_exhausted_run_keeps_last_placement() {
    let gctx = GeometryContext::default();
    let telescope = Telescope::nominal();
    let (tracks, starts) = simulate_tracks(&telescope.transforms(&gctx), 50, 7);

    let alignment = Alignment::new(StraightLineFitter::new(&telescope));
    let options = AlignmentOptions::new(gctx, gctx, update_plane, vec![&telescope.planes[3]])
        .with_config(transverse_shift_config(0.0, 2));

    let result = alignment.align(&tracks, &starts, &options).unwrap();

    assert_eq!(result.status, AlignmentStatus::Exhausted { iterations: 2 });
    assert_eq!(result.iterations, 2);
    let placement = result.aligned_parameters[&SurfaceId(4)];
    let shift = placement.translation.vector - nominal_transform(PLANE_POSITIONS[3]).translation.vector;
    assert!(shift.norm() < 30.0 * UM, "shift = {shift}");
    assert!(matches!(
        result.into_result(),
        Err(AlignmentError::ConvergenceFailure { iterations: 2 })
    ));
}

#[test]
fn test_broken_track_is_skipped() {
    let gctx = GeometryContext::default();
    let telescope = Telescope::nominal();
    let (mut tracks, mut starts) = simulate_tracks(&telescope.transforms(&gctx), 20, 11);
    tracks.push(vec![(
        SurfaceId(42),
        Measurement::local_2d(0.0, 0.0, SIGMA_LOC0, SIGMA_LOC1),
    )]);
    starts.push(starts[0]);
    tracks.push(Vec::new());
    starts.push(starts[0]);

    let counters = Arc::new(AlignmentCounters::new());
    let alignment =
        Alignment::new(StraightLineFitter::new(&telescope)).with_observer(counters.clone());
    let options = AlignmentOptions::new(gctx, gctx, update_plane, vec![&telescope.planes[1]])
        .with_config(transverse_shift_config(0.0, 1));
    let surfaces = AlignableSurfaces::new(&options.aligned_elements).unwrap();
    let mut result = AlignmentResult::new(surfaces.alignment_dof());

    alignment
        .update_alignment_parameters(&tracks, &starts, &options, &surfaces, 0, &mut result)
        .unwrap();

    assert_eq!(result.num_tracks, 20);
    assert_eq!(counters.skipped_tracks(), 2);
    assert_eq!(counters.surface_updates(), 1);
}

#[test]
fn test_parallel_tracks_match_serial() {
    let gctx = GeometryContext::default();
    let mut truth = Telescope::nominal().transforms(&gctx);
    truth[4].1.translation.vector += Vector3::new(0.0, -0.05 * MM, 0.08 * MM);
    let (tracks, starts) = simulate_tracks(&truth, 60, 3);

    let run = |parallel: bool| {
        let telescope = Telescope::nominal();
        let alignment = Alignment::new(StraightLineFitter::new(&telescope));
        let mut config = transverse_shift_config(0.0, 2);
        config.parallel_tracks = parallel;
        let options = AlignmentOptions::new(gctx, gctx, update_plane, vec![&telescope.planes[4]])
            .with_config(config);
        alignment.align(&tracks, &starts, &options).unwrap()
    };

    let serial = run(false);
    let parallel = run(true);

    assert_eq!(serial.num_tracks, parallel.num_tracks);
    assert_eq!(serial.chi2, parallel.chi2);
    assert_eq!(
        serial.aligned_parameters[&SurfaceId(5)],
        parallel.aligned_parameters[&SurfaceId(5)]
    );
}

#[test]
fn test_rejected_update_leaves_geometry() {
    let gctx = GeometryContext::default();
    let mut truth = Telescope::nominal().transforms(&gctx);
    truth[2].1.translation.vector += Vector3::new(0.0, 0.2 * MM, 0.0);
    let (tracks, starts) = simulate_tracks(&truth, 20, 5);

    let telescope = Telescope::nominal();
    let alignment = Alignment::new(StraightLineFitter::new(&telescope));
    let reject = |_: &TelescopePlane, _: &GeometryContext, _: &nalgebra::Isometry3<f64>| false;
    let options = AlignmentOptions::new(gctx, gctx, reject, vec![&telescope.planes[2]])
        .with_config(transverse_shift_config(1.0, 3));

    let err = alignment.align(&tracks, &starts, &options).unwrap_err();

    assert_eq!(
        err,
        AlignmentError::ParameterUpdateFailure {
            surface: SurfaceId(3)
        }
    );
    assert_eq!(
        telescope.planes[2].transform(&gctx),
        nominal_transform(PLANE_POSITIONS[2])
    );
}
