//! `latchkey servo`: exercise the gate servo by hand.

use std::time::Duration;

use anyhow::{Context, Result};
use latchkey_hw::{DryRunServo, Servo, SysfsPwmServo};

pub struct Move {
    pub angle: f32,
    pub rest_angle: f32,
    pub hold: Duration,
    pub chip: u32,
    pub channel: u32,
    pub dry_run: bool,
}

pub fn run(m: Move) -> Result<()> {
    let mut servo: Box<dyn Servo> = if m.dry_run {
        Box::new(DryRunServo::new().0)
    } else {
        Box::new(
            SysfsPwmServo::open(m.chip, m.channel)
                .with_context(|| format!("opening pwmchip{}/pwm{}", m.chip, m.channel))?,
        )
    };

    println!("moving to {}°, holding {} ms", m.angle, m.hold.as_millis());
    servo.set_angle(m.angle).context("servo command failed")?;
    std::thread::sleep(m.hold);

    println!("returning to {}°", m.rest_angle);
    servo.set_angle(m.rest_angle).context("servo command failed")?;
    // Give the horn time to travel before the signal is cut.
    std::thread::sleep(Duration::from_millis(500));
    servo.release().context("servo release failed")?;
    Ok(())
}
