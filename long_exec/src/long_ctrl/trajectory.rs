//! # Trajectory
//!
//! The trajectory to follow is a sequence of points in the map frame, each carrying the target
//! longitudinal velocity and acceleration at that point. A segment is the straight line between
//! two neighbouring points, segment `i` joins point `i` to point `i + 1`.
//!
//! This module provides the sampling operations control needs: nearest point search, signed arc
//! length along the trajectory, distance to the next stop point, the slope of the trajectory and
//! linear interpolation of the target values at an arbitrary pose.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

// Internal
use crate::loc::Pose;
use util::maths::{ang_diff_abs, clamp, lerp};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Velocities below this magnitude are treated as a stop point.
///
/// Units: meters/second
pub const ZERO_VEL_THRESHOLD_MS: f64 = 1e-3;

/// Segments shorter than this are treated as having no direction.
const MIN_SEGMENT_LENGTH_M: f64 = 1e-6;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A single point of the trajectory.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TrajectoryPoint {
    /// Pose of the vehicle at this point
    pub pose: Pose,

    /// Target longitudinal velocity, negative when reversing.
    ///
    /// Units: meters/second
    pub longitudinal_velocity_ms: f64,

    /// Target longitudinal acceleration.
    ///
    /// Units: meters/second^2
    pub acceleration_mss: f64
}

/// A validated trajectory with at least two points.
///
/// Trajectories are immutable once built, a new trajectory replaces the old one wholesale.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Trajectory {
    points: Vec<TrajectoryPoint>
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Reasons a trajectory is rejected.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TrajectoryError {
    #[error("Trajectory must contain at least 2 points, found {0}")]
    TooFewPoints(usize),

    #[error("Trajectory point {0} contains a non-finite value")]
    NonFinitePoint(usize),

    #[error("Trajectory has zero length")]
    ZeroLength
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl TrajectoryPoint {
    fn is_finite(&self) -> bool {
        self.pose.position_m.iter().all(|v| v.is_finite())
            && self.pose.attitude_q.coords.iter().all(|v| v.is_finite())
            && self.longitudinal_velocity_ms.is_finite()
            && self.acceleration_mss.is_finite()
    }
}

impl Trajectory {
    /// Build a trajectory from its points, rejecting it if it is too short or inconsistent.
    pub fn new(points: Vec<TrajectoryPoint>) -> Result<Self, TrajectoryError> {
        if points.len() < 2 {
            return Err(TrajectoryError::TooFewPoints(points.len()))
        }

        if let Some(i) = points.iter().position(|p| !p.is_finite()) {
            return Err(TrajectoryError::NonFinitePoint(i))
        }

        let traj = Self { points };

        if traj.signed_arc_length(0, traj.points.len() - 1) < MIN_SEGMENT_LENGTH_M {
            return Err(TrajectoryError::ZeroLength)
        }

        Ok(traj)
    }

    pub fn points(&self) -> &[TrajectoryPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Find the index of the point nearest to the pose which is within `max_dist_m` of the
    /// position and `max_yaw_rad` of the heading.
    ///
    /// Returns `None` if no point meets both constraints.
    pub fn find_nearest_index(
        &self,
        pose: &Pose,
        max_dist_m: f64,
        max_yaw_rad: f64
    ) -> Option<usize> {
        let pos = pose.position2();
        let heading = pose.get_heading();
        let max_dist_sq = max_dist_m * max_dist_m;

        let mut nearest: Option<(usize, f64)> = None;

        for (i, point) in self.points.iter().enumerate() {
            let dist_sq = (point.pose.position2() - pos).norm_squared();
            if dist_sq > max_dist_sq {
                continue;
            }

            if ang_diff_abs(point.pose.get_heading(), heading) > max_yaw_rad {
                continue;
            }

            match nearest {
                Some((_, d)) if d <= dist_sq => (),
                _ => nearest = Some((i, dist_sq))
            }
        }

        nearest.map(|(i, _)| i)
    }

    /// Index of the point nearest to the position, ignoring heading.
    pub fn find_nearest_index_unconstrained(&self, pos: &Vector2<f64>) -> usize {
        let mut nearest_idx = 0;
        let mut min_dist_sq = f64::MAX;

        for (i, point) in self.points.iter().enumerate() {
            let dist_sq = (point.pose.position2() - pos).norm_squared();
            if dist_sq < min_dist_sq {
                min_dist_sq = dist_sq;
                nearest_idx = i;
            }
        }

        nearest_idx
    }

    /// Find the segment the pose lies on.
    ///
    /// The nearest point is searched for with the distance and heading constraints first, if
    /// none is found the unconstrained nearest point is used instead.
    pub fn find_nearest_segment_index(
        &self,
        pose: &Pose,
        max_dist_m: f64,
        max_yaw_rad: f64
    ) -> usize {
        let pos = pose.position2();
        let nearest_idx = self.find_nearest_index(pose, max_dist_m, max_yaw_rad)
            .unwrap_or_else(|| self.find_nearest_index_unconstrained(&pos));

        self.segment_from_nearest_index(nearest_idx, &pos)
    }

    /// Choose between the segments either side of the nearest point.
    fn segment_from_nearest_index(&self, nearest_idx: usize, pos: &Vector2<f64>) -> usize {
        if nearest_idx == 0 {
            return 0
        }
        if nearest_idx >= self.points.len() - 1 {
            return self.points.len() - 2
        }

        // If the position is behind the nearest point it's on the previous segment
        if self.longitudinal_offset_to_segment(nearest_idx, pos) <= 0.0 {
            nearest_idx - 1
        }
        else {
            nearest_idx
        }
    }

    /// Distance along segment `seg_idx` from its start point to the projection of `pos`.
    ///
    /// Negative if the projection lies behind the start of the segment.
    pub fn longitudinal_offset_to_segment(&self, seg_idx: usize, pos: &Vector2<f64>) -> f64 {
        let start = self.points[seg_idx].pose.position2();
        let end = self.points[seg_idx + 1].pose.position2();

        let seg_vec = end - start;
        let seg_len = seg_vec.norm();
        if seg_len < MIN_SEGMENT_LENGTH_M {
            return 0.0
        }

        seg_vec.dot(&(pos - start)) / seg_len
    }

    /// Arc length (2D) along the trajectory from point `from_idx` to point `to_idx`.
    ///
    /// Negative if `to_idx` is before `from_idx`.
    pub fn signed_arc_length(&self, from_idx: usize, to_idx: usize) -> f64 {
        if from_idx > to_idx {
            return -self.signed_arc_length(to_idx, from_idx)
        }

        self.points[from_idx..=to_idx]
            .windows(2)
            .map(|w| (w[1].pose.position2() - w[0].pose.position2()).norm())
            .sum()
    }

    /// Arc length from the projection of `pos` on segment `seg_idx` to point `to_idx`.
    fn signed_arc_length_from_point(&self, pos: &Vector2<f64>, seg_idx: usize, to_idx: usize) -> f64 {
        self.signed_arc_length(seg_idx, to_idx) - self.longitudinal_offset_to_segment(seg_idx, pos)
    }

    /// Index of the first point with zero target velocity, if any.
    pub fn zero_velocity_index(&self) -> Option<usize> {
        self.points
            .iter()
            .position(|p| p.longitudinal_velocity_ms.abs() < ZERO_VEL_THRESHOLD_MS)
    }

    /// Signed distance along the trajectory from the pose to the stop point.
    ///
    /// The stop point is the first zero velocity point, or the end of the trajectory if there
    /// is none. The distance is negative once the stop point has been passed.
    pub fn stop_distance(&self, pose: &Pose, max_dist_m: f64, max_yaw_rad: f64) -> f64 {
        let end_idx = self.zero_velocity_index().unwrap_or(self.points.len() - 1);
        let seg_idx = self.find_nearest_segment_index(pose, max_dist_m, max_yaw_rad);

        let dist = self.signed_arc_length_from_point(&pose.position2(), seg_idx, end_idx);
        if dist.is_finite() {
            dist
        }
        else {
            0.0
        }
    }

    /// Target values at the pose.
    ///
    /// Poses before the first point or after the last point take the value of that point,
    /// otherwise the target is linearly interpolated along the segment the pose lies on.
    pub fn interpolate(
        &self,
        pose: &Pose,
        nearest_idx: usize,
        max_dist_m: f64,
        max_yaw_rad: f64
    ) -> TrajectoryPoint {
        let pos = pose.position2();
        let last_idx = self.points.len() - 1;

        if nearest_idx == 0 && self.signed_arc_length_from_point(&pos, 0, 0) > 0.0 {
            return self.points[0]
        }
        if nearest_idx >= last_idx
            && self.signed_arc_length_from_point(&pos, last_idx - 1, last_idx) < 0.0
        {
            return self.points[last_idx]
        }

        let seg_idx = self.find_nearest_segment_index(pose, max_dist_m, max_yaw_rad);
        let seg_len = self.signed_arc_length(seg_idx, seg_idx + 1);
        let ratio = if seg_len < MIN_SEGMENT_LENGTH_M {
            0.0
        }
        else {
            clamp(self.longitudinal_offset_to_segment(seg_idx, &pos) / seg_len, 0.0, 1.0)
        };

        lerp_point(&self.points[seg_idx], &self.points[seg_idx + 1], ratio)
    }

    /// Pitch of the trajectory at the nearest point.
    ///
    /// Measured between the nearest point (the rear axle) and the first point more than a wheel
    /// base ahead of it (the front axle). Near the goal, where no point is far enough ahead, the
    /// last wheel base of the trajectory is used instead.
    pub fn pitch_at(&self, nearest_idx: usize, wheel_base_m: f64) -> f64 {
        let last_idx = self.points.len() - 1;
        let nearest = &self.points[nearest_idx.min(last_idx)];

        for point in self.points.iter().skip(nearest_idx + 1) {
            if dist2(nearest, point) > wheel_base_m {
                return pitch_between(nearest, point)
            }
        }

        let last = &self.points[last_idx];
        for point in self.points[..last_idx].iter().rev() {
            if dist2(point, last) > wheel_base_m {
                return pitch_between(point, last)
            }
        }

        pitch_between(&self.points[0], last)
    }

    /// The brake keeping region before the first stop point.
    ///
    /// Walking back from the stop point, the region continues while accelerations keep getting
    /// weaker (larger). Returns the index of the start of the region and the strongest
    /// deceleration within it, or `None` if there is no stop point.
    pub fn brake_keeping_region(&self) -> Option<(usize, f64)> {
        let stop_idx = self.zero_velocity_index()?;

        let mut min_acc = f64::MAX;
        let mut min_acc_idx = stop_idx;

        for i in (0..=stop_idx).rev() {
            let acc = self.points[i].acceleration_mss;
            if acc > min_acc {
                break;
            }
            min_acc = acc;
            min_acc_idx = i;
        }

        Some((min_acc_idx, min_acc))
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn dist2(a: &TrajectoryPoint, b: &TrajectoryPoint) -> f64 {
    (b.pose.position2() - a.pose.position2()).norm()
}

/// Pitch of the line from `from` to `to`, negative when climbing.
fn pitch_between(from: &TrajectoryPoint, to: &TrajectoryPoint) -> f64 {
    let dz = to.pose.position_m[2] - from.pose.position_m[2];
    -dz.atan2(dist2(from, to))
}

fn lerp_point(a: &TrajectoryPoint, b: &TrajectoryPoint, ratio: f64) -> TrajectoryPoint {
    let mut point = *a;

    point.pose.position_m = a.pose.position_m + (b.pose.position_m - a.pose.position_m) * ratio;
    point.pose.attitude_q = a.pose.attitude_q
        .try_slerp(&b.pose.attitude_q, ratio, 1e-9)
        .unwrap_or(a.pose.attitude_q);
    point.longitudinal_velocity_ms = lerp(
        a.longitudinal_velocity_ms, b.longitudinal_velocity_ms, ratio);
    point.acceleration_mss = lerp(a.acceleration_mss, b.acceleration_mss, ratio);

    point
}
