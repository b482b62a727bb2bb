// Copyright 2026  The Selene Authors
// All rights reserved
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use arch::io::{InPort, OutPort, Receiver, Sender};
use bit_field::BitField;
use core::fmt;

pub enum Port {
    Com1,
    Com2,
}

pub struct Console(u16);

impl Console {
    pub fn new(port: Port) -> Console {
        match port {
            Port::Com1 => Console(0x3f8),
            Port::Com2 => Console(0x2f8),
        }
    }

    /// Programs the line discipline: 115200 baud, eight data bits,
    /// no parity, one stop bit, interrupts off.  Run once on the
    /// boot path; output works without it under most firmware, but
    /// not all.
    pub fn init(&mut self) {
        const DIVISOR: u16 = 1;
        self.ier().send(0x00);
        self.lcr().send(0x80);
        self.dll().send((DIVISOR & 0xff) as u8);
        self.dlm().send((DIVISOR >> 8) as u8);
        self.lcr().send(0x03);
        self.fcr().send(0x01);
    }

    fn thr(&mut self) -> OutPort<u8> {
        OutPort::new(self.0)
    }

    fn rbr(&mut self) -> InPort<u8> {
        InPort::new(self.0)
    }

    fn dll(&mut self) -> OutPort<u8> {
        OutPort::new(self.0)
    }

    fn dlm(&mut self) -> OutPort<u8> {
        OutPort::new(self.0 + 1)
    }

    fn ier(&mut self) -> OutPort<u8> {
        OutPort::new(self.0 + 1)
    }

    fn fcr(&mut self) -> OutPort<u8> {
        OutPort::new(self.0 + 2)
    }

    fn lcr(&mut self) -> OutPort<u8> {
        OutPort::new(self.0 + 3)
    }

    fn lsr(&mut self) -> InPort<u8> {
        InPort::new(self.0 + 5)
    }

    fn tx_ready(&mut self) -> bool {
        let mut lsr = self.lsr();
        let b = lsr.recv();
        b.get_bit(5)
    }

    pub fn putb(&mut self, b: u8) {
        while !self.tx_ready() {
            arch::cpu::relax();
        }
        self.thr().send(b);
    }

    pub fn puts(&mut self, s: &str) {
        for b in s.bytes() {
            self.putb(b);
        }
    }

    fn rx_ready(&mut self) -> bool {
        let mut lsr = self.lsr();
        let b = lsr.recv();
        b.get_bit(0)
    }

    pub fn getb(&mut self) -> u8 {
        while !self.rx_ready() {
            arch::cpu::relax();
        }
        self.rbr().recv()
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            if b == b'\n' {
                self.putb(b'\r');
            }
            self.putb(b);
        }
        Ok(())
    }
}
