//! Q16.16 fixed-point arithmetic and 2D vectors.
//!
//! All physics math runs on these types so that a fixed seed and an
//! identical input sequence produce bit-identical state on every platform.
//! `f32` conversions exist for configuration, quantization output and
//! tests only — no float may feed a value that is later hashed.

/// Q16.16 fixed-point value stored in an i32.
pub type Fx = i32;

/// Fractional bits.
pub const FRAC: u32 = 16;
/// 1.0 in Q16.16.
pub const ONE: Fx = 1 << FRAC;
/// Half of 1.0, used for rounding.
pub const HALF: Fx = ONE / 2;

/// pi in Q16.16 (round(pi * 65536)).
pub const PI_FX: Fx = 205_887;
/// 2*pi in Q16.16.
pub const TAU_FX: Fx = 411_775;
/// pi/2 in Q16.16.
pub const HALF_PI_FX: Fx = 102_944;

/// Fixed-point multiply: (a * b) >> FRAC.
#[inline(always)]
pub fn mul(a: Fx, b: Fx) -> Fx {
    ((a as i64 * b as i64) >> FRAC) as Fx
}

/// Fixed-point divide: (a << FRAC) / b. Caller guarantees b != 0.
#[inline(always)]
pub fn div(a: Fx, b: Fx) -> Fx {
    (((a as i64) << FRAC) / b as i64) as Fx
}

/// Convert an integer to fixed-point.
#[inline(always)]
pub const fn fx(v: i32) -> Fx {
    v * ONE
}

/// Convert fixed-point to f32. Presentation/tests only.
#[inline(always)]
pub fn to_f32(v: Fx) -> f32 {
    v as f32 / ONE as f32
}

/// Convert f32 to fixed-point. Configuration/tests only.
#[inline(always)]
pub fn from_f32(v: f32) -> Fx {
    (v * ONE as f32).round() as Fx
}

/// Integer square root of a Q32.32 intermediate, yielding Q16.16.
///
/// `raw` is typically `x*x + y*y` of two Q16.16 values held in an i64,
/// which is exactly the squared value at 32 fractional bits; its square
/// root lands back on 16 fractional bits.
pub fn sqrt_q32(raw: i64) -> Fx {
    if raw <= 0 {
        return 0;
    }
    // Newton's method on integers; converges in < 32 iterations.
    let mut x = raw;
    let mut y = (x + 1) >> 1;
    while y < x {
        x = y;
        y = (x + raw / x) >> 1;
    }
    x as Fx
}

/// Normalizes an angle into [0, TAU_FX).
#[inline]
pub fn angle_normalize(a: Fx) -> Fx {
    let mut a = a % TAU_FX;
    if a < 0 {
        a += TAU_FX;
    }
    a
}

/// Fixed-point sine via the Bhaskara I approximation.
///
/// Max error is about 0.0016 over the full circle, well inside the
/// 1/1024-radian rotation quantization step, and it needs no tables.
pub fn sin(a: Fx) -> Fx {
    let a = angle_normalize(a);
    let (a, sign) = if a < PI_FX { (a, 1) } else { (a - PI_FX, -1) };
    // q = a * (pi - a), a Q32.32 intermediate.
    let q = a as i64 * (PI_FX - a) as i64;
    let num = 16 * q;
    let den = 5 * (PI_FX as i64 * PI_FX as i64) - 4 * q;
    let s = ((num << FRAC) / den) as Fx;
    s * sign
}

/// Fixed-point cosine.
#[inline]
pub fn cos(a: Fx) -> Fx {
    sin(a + HALF_PI_FX)
}

/// A 2D vector of Q16.16 components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vec2 {
    pub x: Fx,
    pub y: Fx,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0, y: 0 };

    #[inline]
    pub const fn new(x: Fx, y: Fx) -> Self {
        Vec2 { x, y }
    }

    /// Vector from integer world units.
    #[inline]
    pub const fn from_int(x: i32, y: i32) -> Self {
        Vec2 { x: fx(x), y: fx(y) }
    }

    #[inline]
    pub fn add(self, o: Vec2) -> Vec2 {
        Vec2::new(self.x + o.x, self.y + o.y)
    }

    #[inline]
    pub fn sub(self, o: Vec2) -> Vec2 {
        Vec2::new(self.x - o.x, self.y - o.y)
    }

    #[inline]
    pub fn scale(self, s: Fx) -> Vec2 {
        Vec2::new(mul(self.x, s), mul(self.y, s))
    }

    #[inline]
    pub fn dot(self, o: Vec2) -> Fx {
        mul(self.x, o.x) + mul(self.y, o.y)
    }

    /// Z component of the 3D cross product, as a Q32.32 i64 to avoid
    /// overflow on large coordinates. Sign is what callers care about.
    #[inline]
    pub fn cross(self, o: Vec2) -> i64 {
        self.x as i64 * o.y as i64 - self.y as i64 * o.x as i64
    }

    /// Squared length as a Q32.32 i64.
    #[inline]
    pub fn length_sq(self) -> i64 {
        self.x as i64 * self.x as i64 + self.y as i64 * self.y as i64
    }

    pub fn length(self) -> Fx {
        sqrt_q32(self.length_sq())
    }

    /// Unit vector, or zero if the vector is zero.
    pub fn normalize(self) -> Vec2 {
        let len = self.length();
        if len == 0 {
            Vec2::ZERO
        } else {
            Vec2::new(div(self.x, len), div(self.y, len))
        }
    }

    /// Rotates the vector by an angle in Q16.16 radians.
    pub fn rotate(self, angle: Fx) -> Vec2 {
        let c = cos(angle);
        let s = sin(angle);
        Vec2::new(
            mul(self.x, c) - mul(self.y, s),
            mul(self.x, s) + mul(self.y, c),
        )
    }
}

/// Unit heading vector for an angle (0 points along +x).
#[inline]
pub fn heading(angle: Fx) -> Vec2 {
    Vec2::new(cos(angle), sin(angle))
}
