//! JR 클록
//!
//! 프로토콜 로컬 시간 단위(JR 틱, 마이크로초 상당)와 벽시계 사이의 변환.
//! 원점은 생성 시점에 한 번 캡처됨. 전역 싱글턴 대신 세션이 명시적으로
//! 소유하고 Arc로 공유함.

use std::time::{Duration, Instant, SystemTime};

/// JR 틱 클록
#[derive(Debug, Clone)]
pub struct JrClock {
    origin_instant: Instant,
    origin_wall: SystemTime,
}

impl JrClock {
    /// 현재 시점을 원점으로 캡처
    pub fn new() -> Self {
        Self {
            origin_instant: Instant::now(),
            origin_wall: SystemTime::now(),
        }
    }

    /// 원점 이후 경과한 JR 틱 (마이크로초)
    pub fn jr_now(&self) -> f64 {
        self.origin_instant.elapsed().as_secs_f64() * 1_000_000.0
    }

    /// 수신한 JR 틱 값을 벽시계 시각으로 변환
    ///
    /// origin_wall + ticks / 1_000_000 초. 음수 틱은 원점으로 고정
    pub fn to_wall(&self, ticks: f64) -> SystemTime {
        if ticks <= 0.0 {
            return self.origin_wall;
        }
        self.origin_wall + Duration::from_secs_f64(ticks / 1_000_000.0)
    }
}

impl Default for JrClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_are_monotonic() {
        let clock = JrClock::new();
        let a = clock.jr_now();
        std::thread::sleep(Duration::from_millis(2));
        let b = clock.jr_now();
        assert!(b > a);
        // 2ms 이상 경과했으니 2000틱 이상
        assert!(b - a >= 2_000.0);
    }

    #[test]
    fn test_wall_translation() {
        let clock = JrClock::new();
        let wall = clock.to_wall(1_500_000.0); // 1.5초

        let delta = wall
            .duration_since(clock.to_wall(0.0))
            .expect("원점 이후여야 함");
        assert_eq!(delta, Duration::from_micros(1_500_000));
    }

    #[test]
    fn test_negative_ticks_clamped_to_origin() {
        let clock = JrClock::new();
        assert_eq!(clock.to_wall(-10.0), clock.to_wall(0.0));
    }
}
