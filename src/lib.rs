pub mod alignment;
pub mod alignment_errors;
pub mod alignment_state;
pub mod constants;
pub mod convergence;
pub mod derivatives;
pub mod fitter;
pub mod geometry;
pub mod global_covariance;
pub mod normal_equations;
pub mod observer;
pub mod solver;
pub mod trajectory;
