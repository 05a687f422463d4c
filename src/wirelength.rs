use ndarray::Array1;

use crate::design::Design;

///weighted average wirelength of every net, summed over both axes, with its
///gradient accumulated onto the nodes
///
///per net and axis: WA = sum x e^(x/g) / sum e^(x/g) - sum x e^(-x/g) / sum e^(-x/g).
///the exponentials are shifted by the net's max (and min) coordinate so large
///coordinates over a small gamma don't overflow
pub fn weighted_average(design: &Design, pos: &Array1<f64>, gamma: f64) -> (f64, Array1<f64>) {
    let layout = design.layout;
    let (pin_x, pin_y) = design.pin_positions(pos);
    let mut grad = Array1::zeros(layout.len());
    let mut total = 0.0;
    let mut coords = Vec::new();
    let mut partials = Vec::new();

    for net in &design.nets {
        if net.len() < 2 {
            continue;
        }
        for (pins, axis_of) in [(&pin_x, 0usize), (&pin_y, 1usize)] {
            coords.clear();
            coords.extend(net.iter().map(|&p| pins[p]));
            total += wa_axis(&coords, gamma, &mut partials);
            for (&p, d) in net.iter().zip(partials.iter()) {
                let node = design.pin2node[p];
                let index = if axis_of == 0 { layout.x(node) } else { layout.y(node) };
                grad[index] += d;
            }
        }
    }
    (total, grad)
}

///WA of one net along one axis, the partial wrt each coordinate goes into `partials`
fn wa_axis(coords: &[f64], gamma: f64, partials: &mut Vec<f64>) -> f64 {
    let max = coords.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min = coords.iter().cloned().fold(f64::INFINITY, f64::min);

    //left term, e^((x - max)/gamma)
    let mut sum_e_pos = 0.0;
    let mut sum_xe_pos = 0.0;
    //right term, e^(-(x - min)/gamma)
    let mut sum_e_neg = 0.0;
    let mut sum_xe_neg = 0.0;
    for &x in coords {
        let ep = ((x - max) / gamma).exp();
        let en = (-(x - min) / gamma).exp();
        sum_e_pos += ep;
        sum_xe_pos += x * ep;
        sum_e_neg += en;
        sum_xe_neg += x * en;
    }
    let avg_pos = sum_xe_pos / sum_e_pos;
    let avg_neg = sum_xe_neg / sum_e_neg;

    partials.clear();
    for &x in coords {
        let ep = ((x - max) / gamma).exp();
        let en = (-(x - min) / gamma).exp();
        // quotient rule on each half
        let d_pos = ep / sum_e_pos * (1.0 + (x - avg_pos) / gamma);
        let d_neg = en / sum_e_neg * (1.0 - (x - avg_neg) / gamma);
        partials.push(d_pos - d_neg);
    }
    avg_pos - avg_neg
}

/// Exact half-perimeter wirelength.
pub fn hpwl(design: &Design, pos: &Array1<f64>) -> f64 {
    let (pin_x, pin_y) = design.pin_positions(pos);
    design
        .nets
        .iter()
        .filter(|net| net.len() >= 2)
        .map(|net| span(net, &pin_x) + span(net, &pin_y))
        .sum()
}

fn span(net: &[usize], coords: &Array1<f64>) -> f64 {
    let (lo, hi) = net.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &p| {
        (lo.min(coords[p]), hi.max(coords[p]))
    });
    hi - lo
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::SyntheticDesign;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn design() -> Design {
        let cfg = SyntheticDesign {
            num_movable: 6,
            num_fixed: 2,
            num_nets: 5,
            max_net_degree: 4,
            width: 10.0,
            height: 10.0,
            num_bins_x: 4,
            num_bins_y: 4,
            ..SyntheticDesign::default()
        };
        Design::synthetic(&cfg, &mut StdRng::seed_from_u64(11)).unwrap()
    }

    fn spread(design: &Design) -> Array1<f64> {
        Array1::from_shape_fn(design.layout.len(), |i| ((i * 37) % 9) as f64 + 0.3)
    }

    #[test]
    fn wa_approaches_hpwl_as_gamma_shrinks() {
        let d = design();
        let pos = spread(&d);
        let exact = hpwl(&d, &pos);
        let (coarse, _) = weighted_average(&d, &pos, 2.0);
        let (fine, _) = weighted_average(&d, &pos, 0.01);
        assert!(coarse < exact);
        assert!(fine <= exact + 1e-9);
        assert_relative_eq!(fine, exact, max_relative = 1e-2);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let d = design();
        let pos = spread(&d);
        let gamma = 0.8;
        let (_, grad) = weighted_average(&d, &pos, gamma);
        let h = 1e-6;
        for i in 0..pos.len() {
            let mut plus = pos.clone();
            let mut minus = pos.clone();
            plus[i] += h;
            minus[i] -= h;
            let numeric =
                (weighted_average(&d, &plus, gamma).0 - weighted_average(&d, &minus, gamma).0) / (2.0 * h);
            assert!((grad[i] - numeric).abs() < 1e-5, "coordinate {i}: {} vs {numeric}", grad[i]);
        }
    }

    #[test]
    fn huge_coordinates_stay_finite() {
        let coords = [1e6, 1e6 + 3.0, 1e6 - 2.0];
        let mut partials = Vec::new();
        let wa = wa_axis(&coords, 0.01, &mut partials);
        assert_relative_eq!(wa, 5.0, max_relative = 1e-9);
        assert!(partials.iter().all(|d| d.is_finite()));
    }

    #[test]
    fn two_pin_hpwl_is_the_bounding_box() {
        let d = design();
        let pos = Array1::zeros(d.layout.len());
        // with every node at the origin only pin offsets remain
        let expected: f64 = d
            .nets
            .iter()
            .map(|net| span(net, &d.pin_offset_x) + span(net, &d.pin_offset_y))
            .sum();
        assert_relative_eq!(hpwl(&d, &pos), expected, max_relative = 1e-12);
    }
}
