//! Fixed-point physics: integration, water drag, ship separation and
//! hull geometry tests. Everything here is Q16.16 integer math; the
//! routines are pure so the rewind buffer can reuse the hull tests
//! against historical state.

use crate::entity::{Player, Projectile, Ship};
use shared::fixed::{self, fx, mul, Fx, Vec2, ONE};
use shared::WORLD_SIZE;

/// Peak forward acceleration at full throttle, units/s².
pub const SHIP_THRUST: Fx = fx(6);
/// Peak angular acceleration at full rudder, rad/s².
pub const SHIP_TURN_ACCEL: Fx = ONE; // 1.0 rad/s^2
/// Linear water drag per second.
pub const WATER_DRAG: Fx = ONE / 2;
/// Angular water drag per second.
pub const ANGULAR_DRAG: Fx = ONE;
/// Extra drag factor once a ship is sinking.
pub const SINKING_DRAG: Fx = 2 * ONE;
/// On-foot player speed, units/s.
pub const PLAYER_SPEED: Fx = fx(6);
/// Cannonball muzzle speed, units/s.
pub const PROJECTILE_SPEED: Fx = fx(40);

/// Clamps a position to the world square.
pub fn clamp_to_world(p: Vec2) -> Vec2 {
    Vec2::new(
        p.x.clamp(0, fx(WORLD_SIZE)),
        p.y.clamp(0, fx(WORLD_SIZE)),
    )
}

/// Advances a ship by one timestep: helm thrust along the heading,
/// rudder torque, then water drag and the buoyancy damping that keeps a
/// drifting hull from coasting forever.
pub fn integrate_ship(ship: &mut Ship, dt: Fx) {
    let thrust = mul(ship.throttle, SHIP_THRUST);
    let accel = fixed::heading(ship.rotation).scale(thrust);
    ship.velocity = ship.velocity.add(accel.scale(dt));
    ship.angular_velocity += mul(mul(ship.rudder, SHIP_TURN_ACCEL), dt);

    let mut drag = WATER_DRAG;
    let mut ang_drag = ANGULAR_DRAG;
    if ship.sinking {
        drag += SINKING_DRAG;
        ang_drag += SINKING_DRAG;
    }
    // Exponential-style damping, stable for dt * drag < 1.
    let keep = ONE - mul(drag, dt);
    ship.velocity = ship.velocity.scale(keep);
    ship.angular_velocity = mul(ship.angular_velocity, ONE - mul(ang_drag, dt));

    ship.position = clamp_to_world(ship.position.add(ship.velocity.scale(dt)));
    ship.rotation = fixed::angle_normalize(ship.rotation + mul(ship.angular_velocity, dt));
}

/// Advances an on-foot player. Movement input is a pre-clamped unit
/// vector; velocity is set, not accumulated, so a dropped command
/// cannot leave a player drifting.
pub fn integrate_player(player: &mut Player, dt: Fx) {
    player.velocity = player.move_input.scale(PLAYER_SPEED);
    player.position = clamp_to_world(player.position.add(player.velocity.scale(dt)));
}

/// Advances a projectile; returns false once its flight time is spent.
pub fn integrate_projectile(proj: &mut Projectile, dt: Fx) -> bool {
    if proj.ticks_left == 0 {
        return false;
    }
    proj.ticks_left -= 1;
    proj.position = proj.position.add(proj.velocity.scale(dt));
    proj.ticks_left > 0
}

/// Separates two overlapping ships by their bounding circles and trades
/// momentum, the cheap stable resolution for hull-on-hull contact.
pub fn resolve_ship_collision(a: &mut Ship, b: &mut Ship) -> bool {
    let delta = b.position.sub(a.position);
    let min_dist = a.bounding_radius + b.bounding_radius;
    let dist_sq = delta.length_sq();
    if dist_sq >= min_dist as i64 * min_dist as i64 {
        return false;
    }
    let dist = fixed::sqrt_q32(dist_sq);
    if dist == 0 {
        // Coincident centers: push apart along x.
        a.position.x -= a.bounding_radius;
        b.position.x += b.bounding_radius;
        return true;
    }
    let normal = Vec2::new(fixed::div(delta.x, dist), fixed::div(delta.y, dist));
    let overlap = min_dist - dist;
    let push = normal.scale(overlap / 2);
    a.position = clamp_to_world(a.position.sub(push));
    b.position = clamp_to_world(b.position.add(push));

    // Elastic-ish exchange with energy loss, matching the arcade feel.
    let keep = ONE * 4 / 5;
    let va = a.velocity;
    a.velocity = b.velocity.scale(keep);
    b.velocity = va.scale(keep);
    a.in_combat = true;
    b.in_combat = true;
    true
}

/// Transforms a world point into hull-local space.
fn to_local(point: Vec2, position: Vec2, rotation: Fx) -> Vec2 {
    point.sub(position).rotate(-rotation)
}

/// Point-in-convex-polygon test against a hull at a given pose.
/// The hull is wound counter-clockwise in local space.
pub fn point_in_hull(point: Vec2, hull: &[Vec2], position: Vec2, rotation: Fx) -> bool {
    if hull.len() < 3 {
        return false;
    }
    let local = to_local(point, position, rotation);
    for i in 0..hull.len() {
        let a = hull[i];
        let b = hull[(i + 1) % hull.len()];
        if b.sub(a).cross(local.sub(a)) < 0 {
            return false;
        }
    }
    true
}

/// Casts a ray of `range` length against a hull at a given pose.
/// Returns the world-space hit point nearest the origin, if any.
pub fn ray_hull_intersect(
    origin: Vec2,
    direction: Vec2,
    range: Fx,
    hull: &[Vec2],
    position: Vec2,
    rotation: Fx,
) -> Option<Vec2> {
    if hull.len() < 2 {
        return None;
    }
    // Work in hull-local space so the intermediates stay small.
    let local_origin = to_local(origin, position, rotation);
    let local_dir = direction.rotate(-rotation);
    let r = local_dir.scale(range);

    // Starting inside the hull is an immediate hit at the origin.
    if point_in_hull(origin, hull, position, rotation) {
        return Some(origin);
    }

    let mut best_t: Option<Fx> = None;
    for i in 0..hull.len() {
        let q = hull[i];
        let s = hull[(i + 1) % hull.len()].sub(q);
        let denom = r.cross(s);
        if denom == 0 {
            continue; // parallel
        }
        let qp = q.sub(local_origin);
        let t = (qp.cross(s) << 16) / denom;
        let u = (qp.cross(r) << 16) / denom;
        if (0..=ONE as i64).contains(&t) && (0..=ONE as i64).contains(&u) {
            let t = t as Fx;
            best_t = Some(match best_t {
                Some(prev) => prev.min(t),
                None => t,
            });
        }
    }
    best_t.map(|t| origin.add(direction.scale(mul(range, t))))
}
